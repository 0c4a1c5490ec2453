//! The capability object handed to every coroutine.
//!
//! A [`Scope`] carries the coroutine's rendezvous state, a handle to the owning
//! dispatcher (for spawning) and the keyed context chain. It is deliberately not
//! `Clone` for user code; a coroutine gets exactly one, and every blocking
//! primitive borrows it.

use std::cell::RefCell;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::channel::{Channel, DecodedChannel};
use crate::context::{CancelScope, ContextChain};
use crate::convert::{default_data_converter, from_payload, to_payload, DataConverter, Payload};
use crate::dispatcher::{self, DispatcherShared};
use crate::env::{MetricsSink, NoopMetrics, WorkflowEnvironment, WorkflowInfo};
use crate::error::{
    panic_message, WorkflowError, ILLEGAL_ACCESS_GUIDANCE, ILLEGAL_ACCESS_PANIC,
};
use crate::options::{QueryRegistry, SignalRegistry};
use crate::selector::Selector;
use crate::state::{CoroState, YieldNow};

/// Context slot: the workflow environment capability.
pub(crate) struct EnvSlot(pub(crate) Rc<dyn WorkflowEnvironment>);

/// Context slot: lazily created signal channels.
pub(crate) struct SignalRegistrySlot(pub(crate) Rc<SignalRegistry>);

/// Context slot: registered query handlers.
pub(crate) struct QueryRegistrySlot(pub(crate) Rc<QueryRegistry>);

/// Context slot: cancellation of this context level.
pub(crate) struct CancelSlot(pub(crate) Rc<CancelScope>);

/// Context slot: where the root coroutine stores the workflow outcome.
pub(crate) struct ResultSlot(
    pub(crate) Rc<RefCell<Option<(Option<Payload>, Option<WorkflowError>)>>>,
);

pub struct Scope {
    coro: Rc<CoroState>,
    dispatcher: Weak<DispatcherShared>,
    ctx: ContextChain,
}

impl Scope {
    pub(crate) fn new(
        coro: Rc<CoroState>,
        dispatcher: Weak<DispatcherShared>,
        ctx: ContextChain,
    ) -> Self {
        Self {
            coro,
            dispatcher,
            ctx,
        }
    }

    pub(crate) fn coro(&self) -> &Rc<CoroState> {
        &self.coro
    }

    /// The extra yield injected before user code in the root coroutine, so
    /// handlers registered synchronously after creation are installed first.
    pub(crate) fn initial_yield(&self) -> YieldNow<'_> {
        self.coro.yield_now("created".to_string())
    }

    /// Name of the coroutine this scope belongs to.
    pub fn coroutine_name(&self) -> &str {
        self.coro.name()
    }

    fn dispatcher(&self) -> Rc<DispatcherShared> {
        self.dispatcher
            .upgrade()
            .unwrap_or_else(|| panic!("{}", ILLEGAL_ACCESS_PANIC))
    }

    /// Spawn a coroutine. It inherits this scope's context and runs after the
    /// current coroutine yields, in spawn order.
    pub fn spawn<F, Fut>(&self, f: F)
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        dispatcher::spawn_on(&self.dispatcher(), self.ctx.clone(), None, f);
    }

    /// [`spawn`](Self::spawn) with an explicit coroutine name, visible in stack
    /// traces.
    pub fn spawn_named<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        dispatcher::spawn_on(&self.dispatcher(), self.ctx.clone(), Some(name.into()), f);
    }

    /// Derive a scope carrying one more context value. The coroutine identity
    /// is unchanged; only spawns from the derived scope see the value.
    pub fn with_value<T: 'static>(&self, value: T) -> Scope {
        Scope {
            coro: Rc::clone(&self.coro),
            dispatcher: self.dispatcher.clone(),
            ctx: self.ctx.with_value(value),
        }
    }

    pub fn value<T: 'static>(&self) -> Option<Rc<T>> {
        self.ctx.value::<T>()
    }

    /// A channel named deterministically within the owning dispatcher.
    pub fn new_channel<T: 'static>(&self, capacity: usize) -> Channel<T> {
        let seq = self.dispatcher().next_channel_sequence();
        Channel::named(format!("chan-{seq}"), capacity)
    }

    /// A selector named deterministically within the owning dispatcher.
    pub fn new_selector(&self) -> Selector {
        let seq = self.dispatcher().next_selector_sequence();
        Selector::named(format!("selector-{seq}"))
    }

    // --- cancellation ---

    fn cancel_scope(&self) -> Rc<CancelScope> {
        self.ctx
            .value::<CancelSlot>()
            .map(|slot| Rc::clone(&slot.0))
            .unwrap_or_else(|| panic!("{}", ILLEGAL_ACCESS_PANIC))
    }

    /// Closed when this context level is canceled; receivable and selectable.
    pub fn done(&self) -> Channel<()> {
        self.cancel_scope().done_channel()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel_scope().is_canceled()
    }

    /// Derive a cancelable scope. The returned closure cancels the derived
    /// level (and its descendants) without touching this one; cancellation of
    /// this level cascades down.
    pub fn with_cancel(&self) -> (Scope, impl Fn()) {
        let child = self.cancel_scope().child();
        let scope = self.with_value(CancelSlot(Rc::clone(&child)));
        (scope, move || child.cancel())
    }

    // --- environment access ---

    pub fn env(&self) -> Option<Rc<dyn WorkflowEnvironment>> {
        self.ctx.value::<EnvSlot>().map(|slot| Rc::clone(&slot.0))
    }

    /// Static information about this execution. Requires a driver-built
    /// context.
    pub fn workflow_info(&self) -> WorkflowInfo {
        self.env()
            .unwrap_or_else(|| panic!("{}", ILLEGAL_ACCESS_PANIC))
            .workflow_info()
    }

    pub fn data_converter(&self) -> Rc<dyn DataConverter> {
        match self.env() {
            Some(env) => env.data_converter(),
            None => default_data_converter(),
        }
    }

    fn metrics(&self) -> Rc<dyn MetricsSink> {
        match self.env() {
            Some(env) => env.metrics(),
            None => Rc::new(NoopMetrics),
        }
    }

    // --- signals ---

    fn signal_registry(&self) -> Rc<SignalRegistry> {
        self.ctx
            .value::<SignalRegistrySlot>()
            .map(|slot| Rc::clone(&slot.0))
            .unwrap_or_else(|| panic!("{}", ILLEGAL_ACCESS_PANIC))
    }

    /// The named signal channel, created on first use.
    pub fn signal_channel(&self, name: &str) -> Channel<Payload> {
        self.signal_registry().channel(name)
    }

    /// Typed view of the named signal channel; payloads decode on receive and
    /// corrupt ones are dropped.
    pub fn typed_signal_channel<T: DeserializeOwned>(&self, name: &str) -> DecodedChannel<T> {
        DecodedChannel::new(
            self.signal_channel(name),
            self.data_converter(),
            self.metrics(),
        )
    }

    // --- queries ---

    fn query_registry(&self) -> Rc<QueryRegistry> {
        self.ctx
            .value::<QueryRegistrySlot>()
            .map(|slot| Rc::clone(&slot.0))
            .unwrap_or_else(|| panic!("{}", ILLEGAL_ACCESS_PANIC))
    }

    /// Register a typed query handler. Arguments decode with the ambient
    /// converter and the return value encodes with it; the contract that the
    /// result is serializable plus an error is the signature itself.
    pub fn set_query_handler<A, R, F>(&self, query_type: &str, mut handler: F)
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: FnMut(A) -> Result<R, WorkflowError> + 'static,
    {
        let converter = self.data_converter();
        self.query_registry().set(
            query_type,
            Box::new(move |args: &Payload| {
                let decoded: A = from_payload(&*converter, args)?;
                match guarded_query_call(|| handler(decoded)) {
                    Ok(Ok(value)) => Ok(to_payload(&*converter, &value)?),
                    Ok(Err(err)) => Err(crate::error::QueryError::Handler(err.to_string())),
                    Err(panic_err) => Err(panic_err),
                }
            }),
        );
    }

    /// Register a query handler over raw payloads; bytes pass through both
    /// ways untouched.
    pub fn set_raw_query_handler<F>(&self, query_type: &str, mut handler: F)
    where
        F: FnMut(&Payload) -> Result<Payload, WorkflowError> + 'static,
    {
        self.query_registry().set(
            query_type,
            Box::new(move |args: &Payload| {
                match guarded_query_call(|| handler(args)) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(crate::error::QueryError::Handler(err.to_string())),
                    Err(panic_err) => Err(panic_err),
                }
            }),
        );
    }
}

/// Run a query handler, converting a panic into a query error. A panic caused
/// by touching blocking workflow APIs is replaced with guidance.
fn guarded_query_call<R>(f: impl FnOnce() -> R) -> Result<R, crate::error::QueryError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Ok(result),
        Err(payload) => {
            let mut message = panic_message(payload.as_ref());
            if message == ILLEGAL_ACCESS_PANIC {
                message = ILLEGAL_ACCESS_GUIDANCE.to_string();
            }
            Err(crate::error::QueryError::HandlerPanic {
                message,
                stack_trace: std::backtrace::Backtrace::force_capture().to_string(),
            })
        }
    }
}
