//! Error taxonomy of the runtime.
//!
//! Programmer errors (double-set promise, negative wait-group counter, send on a
//! closed channel, re-entrant dispatch) panic with one of the message constants
//! below; the dispatcher catches the panic at the coroutine boundary and turns it
//! into a [`PanicError`]. Everything recoverable is an ordinary `Result`.

use thiserror::Error;

/// Panic payload used whenever a workflow-context API is exercised outside a
/// running coroutine. Query handlers that trip it get [`ILLEGAL_ACCESS_GUIDANCE`]
/// in their error instead.
pub const ILLEGAL_ACCESS_PANIC: &str =
    "workflow primitives must be called from a workflow coroutine";

/// Replacement message attached when a query handler panics with
/// [`ILLEGAL_ACCESS_PANIC`].
pub const ILLEGAL_ACCESS_GUIDANCE: &str =
    "query handlers must not use blocking workflow primitives; \
     read workflow state and return it instead";

/// A panic captured at a coroutine boundary, with its rendered backtrace.
#[derive(Debug, Clone, Error)]
#[error("coroutine panic: {message}")]
pub struct PanicError {
    message: String,
    stack_trace: String,
}

impl PanicError {
    pub(crate) fn new(message: impl Into<String>, stack_trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: stack_trace.into(),
        }
    }

    /// The panic payload, downcast to a string where possible.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack_trace(&self) -> &str {
        &self.stack_trace
    }
}

/// Terminal error of a workflow execution.
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Panic(#[from] PanicError),

    #[error("workflow canceled")]
    Canceled,

    /// A payload could not be converted at a point where the workflow itself is
    /// the consumer, e.g. decoding a promise value.
    #[error("payload conversion failed: {0}")]
    DataConversion(String),

    #[error("{0}")]
    Custom(String),
}

impl WorkflowError {
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }
}

impl From<DecodeError> for WorkflowError {
    fn from(err: DecodeError) -> Self {
        Self::DataConversion(err.to_string())
    }
}

/// Failure to encode or decode a payload.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("payload does not match the expected type: {0}")]
    TypeMismatch(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        // serde_json reports both syntax and shape problems through one type;
        // classification only matters for log wording.
        if err.is_data() {
            DecodeError::TypeMismatch(err.to_string())
        } else {
            DecodeError::Malformed(err.to_string())
        }
    }
}

/// Rejected workflow options. Returned synchronously to the configuring caller,
/// never panicked.
#[derive(Debug, Clone, Error)]
pub enum OptionsError {
    #[error("execution_start_to_close_timeout is required and must be positive")]
    MissingExecutionTimeout,

    #[error("task_start_to_close_timeout is required; zero selects the engine default")]
    MissingTaskTimeout,

    #[error("task_start_to_close_timeout must not exceed execution_start_to_close_timeout")]
    TaskTimeoutTooLarge,

    #[error("invalid cron schedule {expression:?}: {reason}")]
    InvalidCronSchedule { expression: String, reason: String },
}

/// Failure of a query dispatch.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("unknown query type {requested:?}, known types: {known:?}")]
    UnknownQueryType {
        requested: String,
        known: Vec<String>,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{0}")]
    Handler(String),

    #[error("query handler panicked: {message}")]
    HandlerPanic { message: String, stack_trace: String },
}

/// Renders a caught panic payload the way a person would want to read it.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    match payload.downcast_ref::<&'static str>() {
        Some(s) => (*s).to_string(),
        None => match payload.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => "panic with a non-string payload".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_query_lists_known_types() {
        let err = QueryError::UnknownQueryType {
            requested: "balance".to_string(),
            known: vec!["__stack_trace".to_string(), "__open_sessions".to_string()],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("balance"));
        assert!(rendered.contains("__stack_trace"));
        assert!(rendered.contains("__open_sessions"));
    }

    #[test]
    fn panic_message_downcasts_both_string_kinds() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom".to_string());
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(42_u32);
        assert!(panic_message(boxed.as_ref()).contains("non-string"));
    }
}
