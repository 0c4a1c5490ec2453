//! Per-coroutine rendezvous state.
//!
//! Exactly one coroutine (or the dispatcher) is runnable at any instant. A
//! coroutine that cannot make progress suspends through [`YieldNow`], which ends
//! the current slice by returning `Pending` once; the dispatcher's next poll of
//! the coroutine is the resume. Primitives report observed progress with
//! [`CoroState::unblocked`], which is what quiescence detection reads.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use pin_project::pin_project;

use crate::error::PanicError;

const ERR_DOUBLE_BLOCK: &str = "coroutine suspended while already suspended, this is a bug";

/// Rendezvous state shared between the dispatcher and one coroutine's scope.
pub(crate) struct CoroState {
    name: String,
    /// True when the last resumed slice saw no progress. Cleared by
    /// [`unblocked`](Self::unblocked), set again on every resume from a yield.
    kept_blocked: Cell<bool>,
    /// True while the coroutine is parked at a yield point.
    blocked: Cell<bool>,
    closed: Cell<bool>,
    yield_status: RefCell<String>,
    panic: RefCell<Option<PanicError>>,
}

impl CoroState {
    pub(crate) fn new(name: String) -> Rc<Self> {
        Rc::new(Self {
            name,
            kept_blocked: Cell::new(false),
            blocked: Cell::new(false),
            closed: Cell::new(false),
            yield_status: RefCell::new("created".to_string()),
            panic: RefCell::new(None),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Called by a primitive immediately after it observed progress.
    pub(crate) fn unblocked(&self) {
        self.kept_blocked.set(false);
    }

    pub(crate) fn kept_blocked(&self) -> bool {
        self.kept_blocked.get()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub(crate) fn close(&self) {
        self.closed.set(true);
    }

    pub(crate) fn record_panic(&self, err: PanicError) {
        *self.panic.borrow_mut() = Some(err);
        self.closed.set(true);
    }

    pub(crate) fn take_panic(&self) -> Option<PanicError> {
        self.panic.borrow_mut().take()
    }

    /// One line of the dispatcher's stack-trace report. Suspended stackless
    /// coroutines have no live host stack, so the yield-point status stands in.
    pub(crate) fn trace_line(&self) -> String {
        let status = self.yield_status.borrow();
        if self.blocked.get() {
            format!("coroutine {} [blocked on {}]", self.name, status)
        } else {
            format!("coroutine {} [{}]", self.name, status)
        }
    }

    /// Suspend the calling coroutine until the dispatcher's next slice.
    pub(crate) fn yield_now(&self, status: String) -> YieldNow<'_> {
        YieldNow {
            state: self,
            status: Some(status),
            phase: PollPhase::Running,
        }
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum PollPhase {
    Running,
    Halted,
}

/// The single suspension point every blocking primitive bottoms out in.
///
/// Returning `Pending` is the about-to-block handoff to the dispatcher; the next
/// poll is the resume, at which point the slice starts out pessimistically marked
/// as kept blocked until some primitive observes progress.
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[pin_project]
pub(crate) struct YieldNow<'a> {
    state: &'a CoroState,
    status: Option<String>,
    phase: PollPhase,
}

impl Future for YieldNow<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.phase {
            PollPhase::Running => {
                if this.state.blocked.replace(true) {
                    panic!("{}", ERR_DOUBLE_BLOCK);
                }
                if let Some(status) = this.status.take() {
                    *this.state.yield_status.borrow_mut() = status;
                }
                *this.phase = PollPhase::Halted;
                Poll::Pending
            }
            PollPhase::Halted => {
                this.state.blocked.set(false);
                this.state.kept_blocked.set(true);
                Poll::Ready(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Context;

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let waker = crate::dispatcher::noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    #[test]
    fn yield_suspends_exactly_once() {
        let state = CoroState::new("test".to_string());
        let mut fut = state.yield_now("blocked on nothing".to_string());
        assert!(poll_once(&mut fut).is_pending());
        assert!(state.blocked.get());
        assert!(!state.kept_blocked());
        assert!(poll_once(&mut fut).is_ready());
        assert!(!state.blocked.get());
        assert!(state.kept_blocked());
    }

    #[test]
    fn unblocked_clears_kept_blocked() {
        let state = CoroState::new("test".to_string());
        let mut fut = state.yield_now("blocked".to_string());
        let _ = poll_once(&mut fut);
        let _ = poll_once(&mut fut);
        assert!(state.kept_blocked());
        state.unblocked();
        assert!(!state.kept_blocked());
    }

    #[test]
    fn trace_line_reports_yield_status() {
        let state = CoroState::new("root".to_string());
        let mut fut = state.yield_now("chan-1.receive".to_string());
        let _ = poll_once(&mut fut);
        assert_eq!(state.trace_line(), "coroutine root [blocked on chan-1.receive]");
    }
}
