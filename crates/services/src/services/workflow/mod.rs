//! Multi-phase workflow engine.
//!
//! A run walks its template's phases in order. Skill phases call the model
//! and checkpoint their result; gate phases persist an `awaiting_<gate>`
//! status and hand control back to whoever dispatched the run.

pub mod artifacts;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod invoker;
pub mod orchestrator;
pub mod pricing;
pub mod progress;
pub mod skills;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::OrchestratorConfig;
pub use dispatcher::{DispatchOutcome, JobDispatcher};
pub use error::WorkflowError;
pub use orchestrator::{ExecutionOutcome, WorkflowOrchestrator};
