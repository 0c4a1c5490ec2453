//! Keyed context chain and cancellation.
//!
//! A [`ContextChain`] is an immutable linked list of typed values; deriving a
//! chain never mutates the parent, so every coroutine sees exactly the values
//! that were in scope when it was spawned. Lookup walks from the newest value,
//! which makes shadowing work the obvious way.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::channel::Channel;

#[derive(Clone, Default)]
pub struct ContextChain {
    head: Option<Rc<ContextNode>>,
}

struct ContextNode {
    value: Rc<dyn Any>,
    parent: Option<Rc<ContextNode>>,
}

impl ContextChain {
    pub fn new() -> Self {
        Self { head: None }
    }

    /// Derive a chain with one more value. The value is keyed by its type.
    pub fn with_value<T: 'static>(&self, value: T) -> Self {
        Self {
            head: Some(Rc::new(ContextNode {
                value: Rc::new(value),
                parent: self.head.clone(),
            })),
        }
    }

    /// Newest value of type `T`, if any.
    pub fn value<T: 'static>(&self) -> Option<Rc<T>> {
        let mut node = self.head.as_ref();
        while let Some(current) = node {
            if let Ok(found) = Rc::downcast::<T>(Rc::clone(&current.value)) {
                return Some(found);
            }
            node = current.parent.as_ref();
        }
        None
    }
}

/// Cancellation state of one context level. Cancelling closes the done channel
/// (releasing every receiver and selector waiting on it) and cascades to child
/// levels.
pub(crate) struct CancelScope {
    canceled: Cell<bool>,
    done: Channel<()>,
    children: RefCell<Vec<Rc<CancelScope>>>,
}

impl CancelScope {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            canceled: Cell::new(false),
            done: Channel::named("done", 0),
            children: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn child(self: &Rc<Self>) -> Rc<Self> {
        let child = CancelScope::new();
        if self.canceled.get() {
            child.cancel();
        } else {
            self.children.borrow_mut().push(Rc::clone(&child));
        }
        child
    }

    /// Idempotent.
    pub(crate) fn cancel(&self) {
        if self.canceled.replace(true) {
            return;
        }
        self.done.close();
        let children = std::mem::take(&mut *self.children.borrow_mut());
        for child in children {
            child.cancel();
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.get()
    }

    pub(crate) fn done_channel(&self) -> Channel<()> {
        self.done.clone()
    }
}
