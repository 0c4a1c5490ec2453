//! The driver that advances all coroutines to the next quiescent point.
//!
//! Coroutines are polled in spawn order, one slice per pass, with a no-op waker;
//! a pass where any coroutine made progress (or a new one was spawned) forces
//! another pass. The loop ends when every survivor reports `kept_blocked`, which
//! makes "all blocked" exact rather than heuristic.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::context::{CancelScope, ContextChain};
use crate::error::{panic_message, PanicError};
use crate::scope::{CancelSlot, Scope};
use crate::state::CoroState;

const ERR_REENTRANT: &str = "execute_until_all_blocked is already running";
const ERR_DISPATCHER_CLOSED: &str = "dispatcher is closed";

pub(crate) type CoroFuture = Pin<Box<dyn Future<Output = ()>>>;

pub(crate) struct CoroCell {
    state: Rc<CoroState>,
    future: RefCell<Option<CoroFuture>>,
}

impl CoroCell {
    /// Give the coroutine one slice. Ready closes it; a panic is recorded with
    /// its rendered backtrace and closes it too.
    fn call(&self) {
        let mut slot = self.future.borrow_mut();
        let Some(future) = slot.as_mut() else {
            self.state.close();
            return;
        };
        let waker = waker::create();
        let mut cx = Context::from_waker(&waker);
        match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => {}
            Ok(Poll::Ready(())) => {
                *slot = None;
                self.state.close();
            }
            Err(payload) => {
                *slot = None;
                let message = panic_message(payload.as_ref());
                let backtrace = std::backtrace::Backtrace::force_capture().to_string();
                self.state.record_panic(PanicError::new(message, backtrace));
            }
        }
    }
}

pub(crate) struct DispatcherShared {
    /// Monotonic spawn sequence; compared across a pass to detect spawns.
    sequence: Cell<u64>,
    channel_sequence: Cell<u64>,
    selector_sequence: Cell<u64>,
    coroutines: RefCell<Vec<Rc<CoroCell>>>,
    executing: Cell<bool>,
    closed: Cell<bool>,
}

impl DispatcherShared {
    pub(crate) fn next_channel_sequence(&self) -> u64 {
        let seq = self.channel_sequence.get() + 1;
        self.channel_sequence.set(seq);
        seq
    }

    pub(crate) fn next_selector_sequence(&self) -> u64 {
        let seq = self.selector_sequence.get() + 1;
        self.selector_sequence.set(seq);
        seq
    }

    pub(crate) fn stack_trace(&self) -> String {
        self.coroutines
            .borrow()
            .iter()
            .filter(|cell| !cell.state.is_closed())
            .map(|cell| cell.state.trace_line())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Append a coroutine to the dispatcher owning `shared` and give it a fresh
/// scope over `ctx`. Unnamed coroutines get their spawn sequence as a name.
pub(crate) fn spawn_on<F, Fut>(
    shared: &Rc<DispatcherShared>,
    ctx: ContextChain,
    name: Option<String>,
    f: F,
) where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = ()> + 'static,
{
    if shared.closed.get() {
        return;
    }
    let seq = shared.sequence.get() + 1;
    shared.sequence.set(seq);
    let name = name.unwrap_or_else(|| seq.to_string());
    let state = CoroState::new(name);
    let scope = Scope::new(Rc::clone(&state), Rc::downgrade(shared), ctx);
    let future: CoroFuture = Box::pin(f(scope));
    shared.coroutines.borrow_mut().push(Rc::new(CoroCell {
        state,
        future: RefCell::new(Some(future)),
    }));
}

/// Owns a set of coroutines and drives them to quiescence.
pub struct Dispatcher {
    shared: Rc<DispatcherShared>,
}

impl Dispatcher {
    /// Create a dispatcher with its root coroutine. A cancellation level is
    /// installed in the context when the caller did not provide one.
    pub fn new<F, Fut>(ctx: ContextChain, root: F) -> Self
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let shared = Rc::new(DispatcherShared {
            sequence: Cell::new(0),
            channel_sequence: Cell::new(0),
            selector_sequence: Cell::new(0),
            coroutines: RefCell::new(Vec::new()),
            executing: Cell::new(false),
            closed: Cell::new(false),
        });
        let ctx = if ctx.value::<CancelSlot>().is_some() {
            ctx
        } else {
            ctx.with_value(CancelSlot(CancelScope::new()))
        };
        spawn_on(&shared, ctx, Some("root".to_string()), root);
        Self { shared }
    }

    pub(crate) fn shared_handle(&self) -> Rc<DispatcherShared> {
        Rc::clone(&self.shared)
    }

    /// Run every coroutine, in spawn order, until all of them are blocked or
    /// done. Returns the first captured panic. Re-entry and running a closed
    /// dispatcher are programmer errors.
    pub fn execute_until_all_blocked(&self) -> Result<(), PanicError> {
        if self.shared.closed.get() {
            panic!("{}", ERR_DISPATCHER_CLOSED);
        }
        if self.shared.executing.replace(true) {
            panic!("{}", ERR_REENTRANT);
        }
        let result = self.run_passes();
        self.shared.executing.set(false);
        if let Err(err) = &result {
            tracing::debug!(error = %err, "coroutine panic surfaced to the environment");
        }
        result
    }

    fn run_passes(&self) -> Result<(), PanicError> {
        let mut all_blocked = false;
        while !all_blocked {
            if self.shared.closed.get() {
                break;
            }
            all_blocked = true;
            let last_sequence = self.shared.sequence.get();
            let mut index = 0;
            loop {
                // Re-read the list each step: a slice may spawn coroutines,
                // which are appended and sliced within this same pass.
                let cell = {
                    let coroutines = self.shared.coroutines.borrow();
                    match coroutines.get(index) {
                        Some(cell) => Rc::clone(cell),
                        None => break,
                    }
                };
                if !cell.state.is_closed() {
                    cell.call();
                }
                if cell.state.is_closed() {
                    // In-place removal preserves the relative order of
                    // survivors; the slot is not advanced past.
                    self.shared.coroutines.borrow_mut().remove(index);
                    if let Some(panic_err) = cell.state.take_panic() {
                        return Err(panic_err);
                    }
                    continue;
                }
                all_blocked = all_blocked && cell.state.kept_blocked();
                index += 1;
            }
            if self.shared.coroutines.borrow().is_empty() {
                break;
            }
            all_blocked = all_blocked && last_sequence == self.shared.sequence.get();
        }
        Ok(())
    }

    /// True when no coroutines remain.
    pub fn is_done(&self) -> bool {
        self.shared.coroutines.borrow().is_empty()
    }

    /// Idempotent. Drops every live coroutine in place; a dropped coroutine
    /// can never run again, so no primitive call survives the close.
    pub fn close(&self) {
        if self.shared.closed.replace(true) {
            return;
        }
        tracing::debug!("closing dispatcher");
        let cells: Vec<_> = self.shared.coroutines.borrow().iter().cloned().collect();
        for cell in cells {
            if !cell.state.is_closed() {
                *cell.future.borrow_mut() = None;
                cell.state.close();
            }
        }
    }

    /// Yield-point report of every live coroutine, separated by blank lines.
    pub fn stack_trace(&self) -> String {
        self.shared.stack_trace()
    }
}

pub(crate) mod waker {
    use std::task::{RawWaker, RawWakerVTable, Waker};

    pub fn create() -> Waker {
        // Safety: The waker points to a vtable with functions that do nothing.
        // Doing nothing is memory-safe.
        unsafe { Waker::from_raw(RAW_WAKER) }
    }

    const RAW_WAKER: RawWaker = RawWaker::new(std::ptr::null(), &VTABLE);
    const VTABLE: RawWakerVTable = RawWakerVTable::new(clone, do_nothing, do_nothing, do_nothing);

    unsafe fn clone(_: *const ()) -> RawWaker {
        RAW_WAKER
    }
    unsafe fn do_nothing(_: *const ()) {}
}

#[cfg(test)]
pub(crate) fn noop_waker() -> std::task::Waker {
    waker::create()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    #[test]
    fn runs_coroutines_in_spawn_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_root = Rc::clone(&log);
        let dispatcher = Dispatcher::new(ContextChain::new(), move |scope| async move {
            log_root.borrow_mut().push("root");
            for label in ["a", "b", "c"] {
                let log = Rc::clone(&log_root);
                scope.spawn(move |_scope| async move {
                    log.borrow_mut().push(label);
                });
            }
        });
        dispatcher.execute_until_all_blocked().unwrap();
        assert_eq!(*log.borrow(), vec!["root", "a", "b", "c"]);
        assert!(dispatcher.is_done());
    }

    #[test]
    fn spawns_during_a_pass_run_before_quiescence() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_root = Rc::clone(&log);
        let dispatcher = Dispatcher::new(ContextChain::new(), move |scope| async move {
            let inner_log = Rc::clone(&log_root);
            scope.spawn(move |scope| async move {
                inner_log.borrow_mut().push("outer");
                let leaf_log = Rc::clone(&inner_log);
                scope.spawn(move |_scope| async move {
                    leaf_log.borrow_mut().push("leaf");
                });
            });
        });
        dispatcher.execute_until_all_blocked().unwrap();
        assert_eq!(*log.borrow(), vec!["outer", "leaf"]);
    }

    #[test]
    fn blocked_coroutines_stay_parked_between_runs() {
        let ch: Channel<u32> = Channel::new(0);
        let seen = Rc::new(Cell::new(None));
        let ch_recv = ch.clone();
        let seen_in = Rc::clone(&seen);
        let dispatcher = Dispatcher::new(ContextChain::new(), move |scope| async move {
            let v = ch_recv.receive(&scope).await;
            seen_in.set(v);
        });
        dispatcher.execute_until_all_blocked().unwrap();
        assert!(!dispatcher.is_done());
        assert_eq!(seen.get(), None);
        // The environment delivers a value between decision turns.
        ch.send_async(5).unwrap();
        dispatcher.execute_until_all_blocked().unwrap();
        assert_eq!(seen.get(), Some(5));
        assert!(dispatcher.is_done());
    }

    #[test]
    fn panic_is_captured_with_its_payload() {
        let dispatcher = Dispatcher::new(ContextChain::new(), |_scope| async move {
            panic!("boom");
        });
        let err = dispatcher.execute_until_all_blocked().unwrap_err();
        assert_eq!(err.message(), "boom");
        assert!(!err.stack_trace().is_empty());
        assert!(dispatcher.is_done());
    }

    #[test]
    fn panic_in_a_later_coroutine_leaves_earlier_ones_alive() {
        let ch: Channel<u32> = Channel::new(0);
        let ch_recv = ch.clone();
        let dispatcher = Dispatcher::new(ContextChain::new(), move |scope| async move {
            scope.spawn(move |scope| async move {
                let _ = ch_recv.receive(&scope).await;
            });
            scope.spawn(|_scope| async move {
                panic!("later one");
            });
            let _ = scope;
        });
        let err = dispatcher.execute_until_all_blocked().unwrap_err();
        assert_eq!(err.message(), "later one");
        assert!(!dispatcher.is_done());
    }

    #[test]
    fn stack_trace_reports_yield_points() {
        let ch: Channel<u32> = Channel::named("inbox", 0);
        let ch_recv = ch.clone();
        let dispatcher = Dispatcher::new(ContextChain::new(), move |scope| async move {
            let _ = ch_recv.receive(&scope).await;
        });
        dispatcher.execute_until_all_blocked().unwrap();
        let trace = dispatcher.stack_trace();
        assert!(trace.contains("coroutine root"));
        assert!(trace.contains("inbox.receive"));
    }

    #[test]
    fn close_is_idempotent_and_drops_coroutines() {
        let ch: Channel<u32> = Channel::new(0);
        let ch_recv = ch.clone();
        let dispatcher = Dispatcher::new(ContextChain::new(), move |scope| async move {
            let _ = ch_recv.receive(&scope).await;
        });
        dispatcher.execute_until_all_blocked().unwrap();
        dispatcher.close();
        dispatcher.close();
        assert!(dispatcher.stack_trace().is_empty());
    }

    #[test]
    #[should_panic(expected = "dispatcher is closed")]
    fn executing_a_closed_dispatcher_panics() {
        let dispatcher = Dispatcher::new(ContextChain::new(), |_scope| async {});
        dispatcher.close();
        let _ = dispatcher.execute_until_all_blocked();
    }
}
