//! Capabilities the runtime consumes from its host.
//!
//! The environment owns everything external: execution metadata, the data
//! converter, context propagators, metrics and the completion callback. The
//! runtime hands it the cancel, signal and query handlers during
//! [`execute`](crate::driver::WorkflowDefinition::execute).

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use crate::convert::{DataConverter, Payload};
use crate::error::{DecodeError, QueryError, WorkflowError};

/// Counter bumped for every corrupt signal payload dropped on receive.
pub const CORRUPTED_SIGNALS_COUNTER: &str = "corrupted-signals";
/// Counter bumped for signals still buffered when the workflow completes.
pub const UNHANDLED_SIGNALS_COUNTER: &str = "unhandled-signals";

/// Narrow metrics capability; the runtime only increments counters.
pub trait MetricsSink {
    fn counter(&self, name: &str, delta: u64);
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &str, _delta: u64) {}
}

/// Static description of one workflow execution.
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub domain: String,
    pub task_list: String,
    pub workflow_type: String,
    pub workflow_id: String,
    pub run_id: String,
    pub execution_start_to_close_timeout: Duration,
    pub task_start_to_close_timeout: Duration,
}

pub trait HeaderReader {
    fn get(&self, key: &str) -> Option<&Payload>;
    fn for_each(&self, f: &mut dyn FnMut(&str, &Payload));
}

pub trait HeaderWriter {
    fn set(&mut self, key: &str, value: Payload);
}

/// Propagated header fields. Ordered so replay observes fields in a fixed
/// sequence.
#[derive(Debug, Clone, Default)]
pub struct Header {
    entries: BTreeMap<String, Payload>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HeaderReader for Header {
    fn get(&self, key: &str) -> Option<&Payload> {
        self.entries.get(key)
    }

    fn for_each(&self, f: &mut dyn FnMut(&str, &Payload)) {
        for (key, value) in &self.entries {
            f(key, value);
        }
    }
}

impl HeaderWriter for Header {
    fn set(&mut self, key: &str, value: Payload) {
        self.entries.insert(key.to_string(), value);
    }
}

/// Carries caller context across the workflow boundary. `extract_to_workflow`
/// runs once before user code; `inject_from_workflow` runs whenever a child
/// inherits headers.
pub trait ContextPropagator {
    fn extract_to_workflow(
        &self,
        ctx: crate::context::ContextChain,
        header: &dyn HeaderReader,
    ) -> Result<crate::context::ContextChain, DecodeError>;

    fn inject_from_workflow(
        &self,
        ctx: &crate::context::ContextChain,
        header: &mut dyn HeaderWriter,
    ) -> Result<(), DecodeError>;
}

pub type CancelHandler = Box<dyn Fn()>;
pub type SignalHandler = Box<dyn FnMut(&str, Payload)>;
pub type QueryHandler = Box<dyn FnMut(&str, Payload) -> Result<Payload, QueryError>>;

/// The host side of one workflow execution.
pub trait WorkflowEnvironment {
    fn workflow_info(&self) -> WorkflowInfo;
    fn data_converter(&self) -> Rc<dyn DataConverter>;
    fn context_propagators(&self) -> Vec<Rc<dyn ContextPropagator>>;
    fn metrics(&self) -> Rc<dyn MetricsSink>;

    /// Invoked by the runtime so the host can report cancellation.
    fn register_cancel_handler(&self, handler: CancelHandler);
    /// Invoked by the runtime so the host can deliver signals.
    fn register_signal_handler(&self, handler: SignalHandler);
    /// Invoked by the runtime so the host can dispatch queries.
    fn register_query_handler(&self, handler: QueryHandler);

    /// Terminal report: the workflow result or its error.
    fn complete(&self, result: Option<Payload>, error: Option<WorkflowError>);
}
