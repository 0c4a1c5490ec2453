//! Deterministic cooperative coroutine runtime for replayable workflow code.
//!
//! A [`Dispatcher`](dispatcher::Dispatcher) drives many logical coroutines on a
//! single thread of control until all of them are blocked or done. Coroutines
//! are plain `async` blocks; every blocking primitive ([`Channel`](channel::Channel),
//! [`Promise`](promise::Promise), [`Selector`](selector::Selector),
//! [`WaitGroup`](wait_group::WaitGroup)) suspends at an explicit yield point, and
//! scheduling order is fixed by spawn order, so re-executions replay the exact
//! same interleaving. The [`WorkflowDriver`](driver::WorkflowDriver) binds a
//! workflow function to a host [`WorkflowEnvironment`](env::WorkflowEnvironment)
//! and runs it one decision turn at a time, delivering signals, queries and
//! cancellation between turns.

pub mod channel;
pub mod context;
pub mod convert;
pub mod dispatcher;
pub mod driver;
pub mod env;
pub mod error;
pub mod options;
pub mod promise;
pub mod scope;
pub mod selector;
mod state;
pub mod wait_group;

pub mod prelude {
    #[doc(hidden)]
    pub use crate::channel::{Channel, DecodedChannel};
    #[doc(hidden)]
    pub use crate::context::ContextChain;
    #[doc(hidden)]
    pub use crate::convert::{DataConverter, JsonDataConverter, Payload};
    #[doc(hidden)]
    pub use crate::dispatcher::Dispatcher;
    #[doc(hidden)]
    pub use crate::driver::{WorkflowDefinition, WorkflowDriver};
    #[doc(hidden)]
    pub use crate::env::{Header, WorkflowEnvironment, WorkflowInfo};
    #[doc(hidden)]
    pub use crate::error::WorkflowError;
    #[doc(hidden)]
    pub use crate::options::WorkflowOptions;
    #[doc(hidden)]
    pub use crate::promise::{DecodedPromise, Promise, Settable};
    #[doc(hidden)]
    pub use crate::scope::Scope;
    #[doc(hidden)]
    pub use crate::selector::Selector;
    #[doc(hidden)]
    pub use crate::wait_group::WaitGroup;
}
