//! One-shot result cells.
//!
//! A [`Promise`] is the read side, a [`Settable`] the write side of the same
//! cell. Readiness is signalled by closing an internal channel, which makes
//! waiting on a promise the same operation as receiving on a closed channel and
//! gives selectors one integration path for both.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;

use serde::de::DeserializeOwned;

use crate::channel::Channel;
use crate::convert::{from_payload, DataConverter, Payload};
use crate::error::WorkflowError;
use crate::scope::Scope;

pub(crate) const ERR_ALREADY_SET: &str = "promise value already set";

struct PromiseState<T> {
    value: RefCell<Option<Result<T, WorkflowError>>>,
    ready: Cell<bool>,
    /// Closed exactly when the value is recorded.
    ready_ch: Channel<()>,
    /// Dependents registered through [`Settable::chain`]; resolved depth first
    /// in registration order.
    chained: RefCell<Vec<Settable<T>>>,
}

/// Read side of a one-shot cell.
pub struct Promise<T> {
    state: Rc<PromiseState<T>>,
}

/// Write side of a one-shot cell. Setting twice panics.
pub struct Settable<T> {
    state: Rc<PromiseState<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> Clone for Settable<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> Promise<T> {
    /// Create a promise and its settable half.
    pub fn new() -> (Promise<T>, Settable<T>) {
        let state = Rc::new(PromiseState {
            value: RefCell::new(None),
            ready: Cell::new(false),
            ready_ch: Channel::named("promise", 0),
            chained: RefCell::new(Vec::new()),
        });
        (
            Promise {
                state: Rc::clone(&state),
            },
            Settable { state },
        )
    }

    pub fn is_ready(&self) -> bool {
        self.state.ready.get()
    }

    pub(crate) fn ready_channel(&self) -> &Channel<()> {
        &self.state.ready_ch
    }
}

impl<T: Clone> Promise<T> {
    /// Wait until the promise resolves, then return its value.
    pub async fn get(&self, scope: &Scope) -> Result<T, WorkflowError> {
        let _ = self.state.ready_ch.receive_with_more(scope).await;
        self.peek()
            .expect("promise readiness channel closed before the value was recorded")
    }

    /// Snapshot read without blocking.
    pub fn peek(&self) -> Option<Result<T, WorkflowError>> {
        self.state.value.borrow().clone()
    }
}

impl<T: Clone> Settable<T> {
    /// Resolve the cell. Unblocks every waiter and selector, then resolves
    /// chained promises in registration order.
    pub fn set(&self, result: Result<T, WorkflowError>) {
        if self.state.ready.get() {
            panic!("{}", ERR_ALREADY_SET);
        }
        *self.state.value.borrow_mut() = Some(result);
        self.state.ready.set(true);
        self.state.ready_ch.close();
        let chained = std::mem::take(&mut *self.state.chained.borrow_mut());
        for dependent in chained {
            let value = self
                .state
                .value
                .borrow()
                .clone()
                .expect("value recorded above");
            dependent.set(value);
        }
    }

    pub fn set_value(&self, value: T) {
        self.set(Ok(value));
    }

    pub fn set_error(&self, error: WorkflowError) {
        self.set(Err(error));
    }

    /// Make this cell mirror `source`: if `source` is already ready its value is
    /// copied now, otherwise this cell resolves when `source` does.
    ///
    /// Chaining a promise into its own ancestry would recurse on `set` and is a
    /// caller error.
    pub fn chain(&self, source: &Promise<T>) {
        if source.state.ready.get() {
            let value = source
                .state
                .value
                .borrow()
                .clone()
                .expect("ready promise carries a value");
            self.set(value);
            return;
        }
        source.state.chained.borrow_mut().push(self.clone());
    }
}

/// A promise carrying a serialized payload, decoded on `get`.
///
/// Decode failures surface to the caller as [`WorkflowError::DataConversion`];
/// unlike signal channels there is no retry, a one-shot cell has nothing else
/// to offer.
pub struct DecodedPromise<T> {
    raw: Promise<Payload>,
    converter: Rc<dyn DataConverter>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DecodedPromise<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            converter: Rc::clone(&self.converter),
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> DecodedPromise<T> {
    pub fn new(raw: Promise<Payload>, converter: Rc<dyn DataConverter>) -> Self {
        Self {
            raw,
            converter,
            _marker: PhantomData,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.raw.is_ready()
    }

    pub fn raw(&self) -> &Promise<Payload> {
        &self.raw
    }

    pub async fn get(&self, scope: &Scope) -> Result<T, WorkflowError> {
        let payload = self.raw.get(scope).await?;
        from_payload(&*self.converter, &payload).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_resolves_and_closes_readiness() {
        let (promise, settable) = Promise::new();
        assert!(!promise.is_ready());
        settable.set_value(42);
        assert!(promise.is_ready());
        assert!(promise.ready_channel().is_closed());
        assert_eq!(promise.peek().unwrap().unwrap(), 42);
    }

    #[test]
    #[should_panic(expected = "already set")]
    fn double_set_panics() {
        let (_promise, settable) = Promise::new();
        settable.set_value(1);
        settable.set_value(2);
    }

    #[test]
    fn chain_propagates_in_registration_order() {
        let (f1, s1) = Promise::new();
        let (f2, s2) = Promise::new();
        let (f3, s3) = Promise::new();
        s2.chain(&f1);
        s3.chain(&f1);
        s1.set_value(42);
        assert_eq!(f2.peek().unwrap().unwrap(), 42);
        assert_eq!(f3.peek().unwrap().unwrap(), 42);
    }

    #[test]
    fn chain_to_ready_promise_copies_immediately() {
        let (f1, s1) = Promise::new();
        s1.set_value(7);
        let (f2, s2) = Promise::new();
        s2.chain(&f1);
        assert!(f2.is_ready());
        assert_eq!(f2.peek().unwrap().unwrap(), 7);
    }

    #[test]
    fn errors_mirror_through_chains() {
        let (f1, s1) = Promise::<u32>::new();
        let (f2, s2) = Promise::new();
        s2.chain(&f1);
        s1.set_error(WorkflowError::custom("nope"));
        assert!(matches!(
            f2.peek().unwrap(),
            Err(WorkflowError::Custom(msg)) if msg == "nope"
        ));
    }
}
