//! Counting barrier built on a promise pair.

use std::cell::RefCell;
use std::rc::Rc;

use crate::promise::{Promise, Settable};
use crate::scope::Scope;

const ERR_NEGATIVE_COUNTER: &str = "wait group counter dropped below zero";
const ERR_CONCURRENT_WAIT: &str = "wait group is already being waited on";

struct WaitGroupState {
    n: i64,
    waiting: bool,
    promise: Promise<()>,
    settable: Settable<()>,
}

/// Counting barrier. `wait` returns once the counter reaches zero; the group is
/// reusable after a `wait` has returned.
#[derive(Clone)]
pub struct WaitGroup {
    state: Rc<RefCell<WaitGroupState>>,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    pub fn new() -> Self {
        let (promise, settable) = Promise::new();
        Self {
            state: Rc::new(RefCell::new(WaitGroupState {
                n: 0,
                waiting: false,
                promise,
                settable,
            })),
        }
    }

    /// Adjust the counter. Panics if it goes negative. A waiter parked in
    /// [`wait`](Self::wait) is released when the counter reaches zero.
    pub fn add(&self, delta: i64) {
        let release = {
            let mut state = self.state.borrow_mut();
            state.n += delta;
            if state.n < 0 {
                panic!("{}", ERR_NEGATIVE_COUNTER);
            }
            if state.n == 0 && state.waiting {
                Some(state.settable.clone())
            } else {
                None
            }
        };
        // Resolve outside the borrow: waking waiters runs their callbacks.
        if let Some(settable) = release {
            settable.set_value(());
        }
    }

    pub fn done(&self) {
        self.add(-1);
    }

    /// Block until the counter reaches zero. Two coroutines waiting at once is
    /// a programmer error.
    pub async fn wait(&self, scope: &Scope) {
        let promise = {
            let mut state = self.state.borrow_mut();
            if state.n <= 0 {
                return;
            }
            if state.waiting {
                panic!("{}", ERR_CONCURRENT_WAIT);
            }
            state.waiting = true;
            state.promise.clone()
        };
        let _ = promise.get(scope).await;
        let mut state = self.state.borrow_mut();
        state.waiting = false;
        // Fresh pair so the group can be reused.
        let (promise, settable) = Promise::new();
        state.promise = promise;
        state.settable = settable;
    }
}
