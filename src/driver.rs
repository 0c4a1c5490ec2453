//! Binds a user workflow function to an environment and drives it turn by turn.
//!
//! `execute` builds the root context, spawns the root coroutine and hands the
//! environment its cancel/signal/query handlers. Each decision turn the
//! environment calls `on_decision_task_started`, which runs the dispatcher to
//! quiescence and reports completion once the root coroutine stored a result.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use crate::context::{CancelScope, ContextChain};
use crate::convert::{to_payload, Payload};
use crate::dispatcher::{Dispatcher, DispatcherShared};
use crate::env::{Header, WorkflowEnvironment, UNHANDLED_SIGNALS_COUNTER};
use crate::error::{QueryError, WorkflowError};
use crate::options::{QueryRegistry, SignalRegistry};
use crate::scope::{
    CancelSlot, EnvSlot, QueryRegistrySlot, ResultSlot, Scope, SignalRegistrySlot,
};

/// Reports the live yield points of every coroutine.
pub const QUERY_TYPE_STACK_TRACE: &str = "__stack_trace";
/// Reports sessions held open by the workflow; none are tracked here, the
/// query exists so hosts can poll it unconditionally.
pub const QUERY_TYPE_OPEN_SESSIONS: &str = "__open_sessions";

const BUILTIN_QUERY_TYPES: &[&str] = &[QUERY_TYPE_STACK_TRACE, QUERY_TYPE_OPEN_SESSIONS];

const ERR_SIGNAL_BUFFER_FULL: &str = "signal channel buffer is full";

pub type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// The bound workflow entry point: scope plus encoded inputs to an encoded
/// result.
pub type WorkflowFn =
    Rc<dyn Fn(Scope, Vec<Payload>) -> LocalBoxFuture<Result<Option<Payload>, WorkflowError>>>;

/// Wraps a workflow function with another one. Factories compose so the first
/// registered is outermost.
pub type InterceptorFactory = Box<dyn Fn(WorkflowFn) -> WorkflowFn>;

/// Contract between the runtime and the code that owns workflow executions.
pub trait WorkflowDefinition {
    /// Bind to an environment and spawn the root coroutine. Nothing runs until
    /// the first decision turn.
    fn execute(&mut self, env: Rc<dyn WorkflowEnvironment>, header: Header, input: Vec<Payload>);

    /// Run one decision turn to quiescence.
    fn on_decision_task_started(&mut self);

    fn stack_trace(&self) -> String;

    fn close(&mut self);
}

struct Execution {
    dispatcher: Dispatcher,
    env: Rc<dyn WorkflowEnvironment>,
    result: Rc<RefCell<Option<(Option<Payload>, Option<WorkflowError>)>>>,
    signals: Rc<SignalRegistry>,
    completed: Cell<bool>,
}

/// Drives one user workflow function per execution.
pub struct WorkflowDriver {
    workflow_fn: WorkflowFn,
    interceptor_factories: Vec<InterceptorFactory>,
    execution: Option<Execution>,
}

impl WorkflowDriver {
    pub fn new<F, Fut>(workflow: F) -> Self
    where
        F: Fn(Scope, Vec<Payload>) -> Fut + 'static,
        Fut: Future<Output = Result<Option<Payload>, WorkflowError>> + 'static,
    {
        Self {
            workflow_fn: Rc::new(
                move |scope, input| -> LocalBoxFuture<Result<Option<Payload>, WorkflowError>> {
                    Box::pin(workflow(scope, input))
                },
            ),
            interceptor_factories: Vec::new(),
            execution: None,
        }
    }

    /// Register an interceptor factory. The first registered factory becomes
    /// the outermost wrapper.
    pub fn add_interceptor(&mut self, factory: InterceptorFactory) -> &mut Self {
        self.interceptor_factories.push(factory);
        self
    }

    fn wrapped_workflow(&self) -> WorkflowFn {
        let mut wrapped = Rc::clone(&self.workflow_fn);
        for factory in self.interceptor_factories.iter().rev() {
            wrapped = factory(wrapped);
        }
        wrapped
    }
}

impl WorkflowDefinition for WorkflowDriver {
    fn execute(&mut self, env: Rc<dyn WorkflowEnvironment>, header: Header, input: Vec<Payload>) {
        let result = Rc::new(RefCell::new(None));
        let signals = Rc::new(SignalRegistry::new());
        let queries = Rc::new(QueryRegistry::new());
        let cancel = CancelScope::new();

        let mut ctx = ContextChain::new()
            .with_value(EnvSlot(Rc::clone(&env)))
            .with_value(SignalRegistrySlot(Rc::clone(&signals)))
            .with_value(QueryRegistrySlot(Rc::clone(&queries)))
            .with_value(CancelSlot(Rc::clone(&cancel)))
            .with_value(ResultSlot(Rc::clone(&result)));

        // Propagated caller context lands in the chain before user code runs.
        let mut propagation_error = None;
        for propagator in env.context_propagators() {
            match propagator.extract_to_workflow(ctx.clone(), &header) {
                Ok(extended) => ctx = extended,
                Err(err) => {
                    propagation_error = Some(err);
                    break;
                }
            }
        }

        let workflow = self.wrapped_workflow();
        let dispatcher = Dispatcher::new(ctx, move |scope| async move {
            // Handlers registered synchronously after creation must be
            // installed before user code observes anything.
            scope.initial_yield().await;
            let slot = scope
                .value::<ResultSlot>()
                .expect("root context carries the result slot");
            let outcome = match propagation_error {
                Some(err) => Err(WorkflowError::from(err)),
                None => workflow(scope, input).await,
            };
            let (value, error) = match outcome {
                Ok(value) => (value, None),
                Err(err) => (None, Some(err)),
            };
            *slot.0.borrow_mut() = Some((value, error));
        });

        {
            let cancel = Rc::clone(&cancel);
            env.register_cancel_handler(Box::new(move || cancel.cancel()));
        }
        {
            let signals = Rc::clone(&signals);
            env.register_signal_handler(Box::new(move |name, payload| {
                let channel = signals.channel(name);
                if channel.send_async(payload).is_err() {
                    panic!("{ERR_SIGNAL_BUFFER_FULL}: {name}");
                }
            }));
        }
        {
            let queries = Rc::clone(&queries);
            let shared = dispatcher.shared_handle();
            let converter = env.data_converter();
            env.register_query_handler(Box::new(move |query_type, args| {
                dispatch_query(&queries, &shared, &*converter, query_type, &args)
            }));
        }

        self.execution = Some(Execution {
            dispatcher,
            env,
            result,
            signals,
            completed: Cell::new(false),
        });
    }

    fn on_decision_task_started(&mut self) {
        let Some(execution) = &self.execution else {
            return;
        };
        if execution.completed.get() {
            return;
        }
        if let Err(panic_err) = execution.dispatcher.execute_until_all_blocked() {
            execution.completed.set(true);
            execution
                .env
                .complete(None, Some(WorkflowError::Panic(panic_err)));
            return;
        }
        let outcome = execution.result.borrow().clone();
        if let Some((value, error)) = outcome {
            execution.completed.set(true);
            let unconsumed = execution.signals.unconsumed();
            if !unconsumed.is_empty() {
                for (name, buffered) in &unconsumed {
                    tracing::warn!(
                        signal = name.as_str(),
                        buffered,
                        "signal was never consumed by the workflow"
                    );
                }
                let total: u64 = unconsumed.iter().map(|(_, n)| *n as u64).sum();
                execution
                    .env
                    .metrics()
                    .counter(UNHANDLED_SIGNALS_COUNTER, total);
            }
            execution.env.complete(value, error);
        }
    }

    fn stack_trace(&self) -> String {
        match &self.execution {
            Some(execution) => execution.dispatcher.stack_trace(),
            None => String::new(),
        }
    }

    fn close(&mut self) {
        if let Some(execution) = &self.execution {
            execution.dispatcher.close();
        }
    }
}

fn dispatch_query(
    queries: &QueryRegistry,
    dispatcher: &Rc<DispatcherShared>,
    converter: &dyn crate::convert::DataConverter,
    query_type: &str,
    args: &Payload,
) -> Result<Payload, QueryError> {
    match query_type {
        QUERY_TYPE_STACK_TRACE => Ok(to_payload(converter, &dispatcher.stack_trace())?),
        QUERY_TYPE_OPEN_SESSIONS => {
            Ok(to_payload(converter, &Vec::<serde_json::Value>::new())?)
        }
        _ => queries.dispatch(query_type, args, BUILTIN_QUERY_TYPES),
    }
}
