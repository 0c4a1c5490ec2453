//! Per-execution options and the signal/query registries.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;

use crate::channel::Channel;
use crate::convert::{DataConverter, Payload};
use crate::env::ContextPropagator;
use crate::error::{OptionsError, QueryError};

/// Buffer size of lazily created signal channels. Deliveries beyond this are a
/// fatal error rather than silent loss.
pub const SIGNAL_CHANNEL_CAPACITY: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowIdReusePolicy {
    #[default]
    AllowDuplicateFailedOnly,
    AllowDuplicate,
    RejectDuplicate,
    TerminateIfRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentClosePolicy {
    #[default]
    Terminate,
    RequestCancel,
    Abandon,
}

/// Retry configuration, carried through to the orchestrating collaborator and
/// validated there.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub initial_interval: Option<Duration>,
    pub backoff_coefficient: f64,
    pub maximum_interval: Option<Duration>,
    pub maximum_attempts: u32,
    pub non_retriable_error_reasons: Vec<String>,
}

/// Options of one workflow execution. Everything the runtime itself does not
/// interpret is carried opaquely for collaborators.
#[derive(Clone, Default)]
pub struct WorkflowOptions {
    pub domain: Option<String>,
    pub task_list: Option<String>,
    pub workflow_id: Option<String>,
    pub workflow_id_reuse_policy: WorkflowIdReusePolicy,
    pub execution_start_to_close_timeout: Option<Duration>,
    /// Required; zero selects the engine default.
    pub task_start_to_close_timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    pub cron_schedule: Option<String>,
    pub data_converter: Option<Rc<dyn DataConverter>>,
    pub context_propagators: Vec<Rc<dyn ContextPropagator>>,
    pub memo: BTreeMap<String, Payload>,
    pub search_attributes: BTreeMap<String, Payload>,
    pub parent_close_policy: ParentClosePolicy,
}

impl WorkflowOptions {
    /// Validation never panics; a misconfiguration is the caller's error to
    /// handle.
    pub fn validate(&self) -> Result<(), OptionsError> {
        let execution = match self.execution_start_to_close_timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => return Err(OptionsError::MissingExecutionTimeout),
        };
        let Some(task) = self.task_start_to_close_timeout else {
            return Err(OptionsError::MissingTaskTimeout);
        };
        if task > execution {
            return Err(OptionsError::TaskTimeoutTooLarge);
        }
        if let Some(expression) = &self.cron_schedule {
            validate_cron(expression)?;
        }
        Ok(())
    }
}

/// Validate a five-field cron expression. The parser wants a seconds field, so
/// one is pinned in front before parsing.
fn validate_cron(expression: &str) -> Result<(), OptionsError> {
    let with_seconds = format!("0 {expression}");
    cron::Schedule::from_str(&with_seconds)
        .map(|_| ())
        .map_err(|err| OptionsError::InvalidCronSchedule {
            expression: expression.to_string(),
            reason: err.to_string(),
        })
}

/// Signal name to channel mapping; channels appear on first use.
pub(crate) struct SignalRegistry {
    channels: RefCell<BTreeMap<String, Channel<Payload>>>,
}

impl SignalRegistry {
    pub(crate) fn new() -> Self {
        Self {
            channels: RefCell::new(BTreeMap::new()),
        }
    }

    pub(crate) fn channel(&self, name: &str) -> Channel<Payload> {
        self.channels
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| {
                Channel::named(format!("signal {name}"), SIGNAL_CHANNEL_CAPACITY)
            })
            .clone()
    }

    /// Signals still sitting in their buffers, reported at completion.
    pub(crate) fn unconsumed(&self) -> Vec<(String, usize)> {
        self.channels
            .borrow()
            .iter()
            .filter(|(_, channel)| channel.buffered_len() > 0)
            .map(|(name, channel)| (name.clone(), channel.buffered_len()))
            .collect()
    }
}

pub(crate) type QueryHandlerFn = Box<dyn FnMut(&Payload) -> Result<Payload, QueryError>>;

/// Query type to handler mapping.
pub(crate) struct QueryRegistry {
    handlers: RefCell<BTreeMap<String, QueryHandlerFn>>,
}

impl QueryRegistry {
    pub(crate) fn new() -> Self {
        Self {
            handlers: RefCell::new(BTreeMap::new()),
        }
    }

    /// Registering twice replaces the previous handler.
    pub(crate) fn set(&self, query_type: &str, handler: QueryHandlerFn) {
        self.handlers
            .borrow_mut()
            .insert(query_type.to_string(), handler);
    }

    pub(crate) fn known_types(&self) -> Vec<String> {
        self.handlers.borrow().keys().cloned().collect()
    }

    /// Invoke the handler for `query_type`. An unknown type reports every
    /// known type, including the built-ins the driver serves itself.
    pub(crate) fn dispatch(
        &self,
        query_type: &str,
        args: &Payload,
        builtin_types: &[&str],
    ) -> Result<Payload, QueryError> {
        // The handler runs outside the borrow; it may register new handlers.
        let handler = self.handlers.borrow_mut().remove(query_type);
        match handler {
            Some(mut handler) => {
                let result = handler(args);
                self.handlers
                    .borrow_mut()
                    .entry(query_type.to_string())
                    .or_insert(handler);
                result
            }
            None => {
                let mut known: Vec<String> =
                    builtin_types.iter().map(|s| s.to_string()).collect();
                known.extend(self.known_types());
                Err(QueryError::UnknownQueryType {
                    requested: query_type.to_string(),
                    known,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_options() -> WorkflowOptions {
        WorkflowOptions {
            execution_start_to_close_timeout: Some(Duration::from_secs(60)),
            task_start_to_close_timeout: Some(Duration::from_secs(10)),
            ..WorkflowOptions::default()
        }
    }

    #[test]
    fn execution_timeout_is_required_and_positive() {
        let mut options = valid_options();
        assert!(options.validate().is_ok());
        options.execution_start_to_close_timeout = None;
        assert!(matches!(
            options.validate(),
            Err(OptionsError::MissingExecutionTimeout)
        ));
        options.execution_start_to_close_timeout = Some(Duration::ZERO);
        assert!(matches!(
            options.validate(),
            Err(OptionsError::MissingExecutionTimeout)
        ));
    }

    #[test]
    fn task_timeout_is_required() {
        let mut options = valid_options();
        options.task_start_to_close_timeout = None;
        assert!(matches!(
            options.validate(),
            Err(OptionsError::MissingTaskTimeout)
        ));
    }

    #[test]
    fn zero_task_timeout_means_engine_default() {
        let mut options = valid_options();
        options.task_start_to_close_timeout = Some(Duration::ZERO);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn task_timeout_cannot_exceed_execution_timeout() {
        let mut options = valid_options();
        options.task_start_to_close_timeout = Some(Duration::from_secs(120));
        assert!(matches!(
            options.validate(),
            Err(OptionsError::TaskTimeoutTooLarge)
        ));
    }

    #[test]
    fn cron_schedules_are_checked() {
        let mut options = valid_options();
        options.cron_schedule = Some("*/5 * * * *".to_string());
        assert!(options.validate().is_ok());
        options.cron_schedule = Some("not a schedule".to_string());
        assert!(matches!(
            options.validate(),
            Err(OptionsError::InvalidCronSchedule { .. })
        ));
    }

    #[test]
    fn signal_channels_are_created_lazily_and_cached() {
        let registry = SignalRegistry::new();
        let a = registry.channel("go");
        let b = registry.channel("go");
        a.send_async(Payload(vec![1])).unwrap();
        assert_eq!(b.receive_async(), Some(Payload(vec![1])));
        assert!(registry.unconsumed().is_empty());
    }

    #[test]
    fn unknown_query_reports_builtins_and_registered() {
        let registry = QueryRegistry::new();
        registry.set("status", Box::new(|_args| Ok(Payload(vec![]))));
        let err = registry
            .dispatch("nope", &Payload(vec![]), &["__stack_trace"])
            .unwrap_err();
        match err {
            QueryError::UnknownQueryType { requested, known } => {
                assert_eq!(requested, "nope");
                assert!(known.contains(&"__stack_trace".to_string()));
                assert!(known.contains(&"status".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
