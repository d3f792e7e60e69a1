use db::models::{workflow_run::WorkflowRunError, workflow_template::WorkflowTemplateError};
use thiserror::Error;
use uuid::Uuid;

/// Failure of the run state store or catalog.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Run {run_id} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        run_id: Uuid,
        expected: i64,
        actual: i64,
    },
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),
    #[error("Invalid stored data: {0}")]
    Invalid(String),
}

impl From<WorkflowRunError> for StoreError {
    fn from(err: WorkflowRunError) -> Self {
        match err {
            WorkflowRunError::Database(e) => StoreError::Database(e),
            WorkflowRunError::VersionConflict {
                run_id,
                expected,
                actual,
            } => StoreError::Conflict {
                run_id,
                expected,
                actual,
            },
            WorkflowRunError::NotFound(id) => StoreError::RunNotFound(id),
            WorkflowRunError::Serde(e) => StoreError::Invalid(e.to_string()),
            WorkflowRunError::Corrupt(msg) => StoreError::Invalid(msg),
        }
    }
}

impl From<WorkflowTemplateError> for StoreError {
    fn from(err: WorkflowTemplateError) -> Self {
        match err {
            WorkflowTemplateError::Database(e) => StoreError::Database(e),
            other => StoreError::Invalid(other.to_string()),
        }
    }
}

/// How a run-level error should be treated by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing or invalid inputs. Fatal to the run.
    Configuration,
    /// Another writer moved the run. The pass stops without writing.
    Conflict,
    /// Store failure. Fatal to the run.
    Infrastructure,
    /// The run was cancelled while a phase was in flight.
    Cancelled,
}

/// Errors that escape the phase loop and end an execution pass.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Workflow run not found: {0}")]
    RunNotFound(Uuid),
    #[error("Workflow template not found: {0}")]
    TemplateNotFound(Uuid),
    #[error("Invalid workflow template: {0}")]
    InvalidTemplate(String),
    #[error("Site config not found: {0}")]
    SiteNotFound(Uuid),
    #[error("Phase '{0}' needs site credentials but the run has no site")]
    SiteRequired(String),
    #[error("Resume index {index} is out of range for a template with {total} phases")]
    ResumeOutOfRange { index: usize, total: usize },
    #[error("Workflow run {0} was cancelled")]
    RunCancelled(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkflowError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WorkflowError::Store(StoreError::Conflict { .. }) => ErrorClass::Conflict,
            WorkflowError::Store(StoreError::RunNotFound(_)) => ErrorClass::Configuration,
            WorkflowError::Store(_) => ErrorClass::Infrastructure,
            WorkflowError::RunCancelled(_) => ErrorClass::Cancelled,
            _ => ErrorClass::Configuration,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }
}
