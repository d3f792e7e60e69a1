//! Entry point for job deliveries.
//!
//! The dispatcher guarantees at most one execution pass per run inside this
//! process. A second delivery for a run that is already executing is turned
//! away instead of interleaving writes with the first.

use std::sync::Arc;

use dashmap::DashSet;
use uuid::Uuid;

use super::orchestrator::{ExecutionOutcome, WorkflowOrchestrator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Executed(ExecutionOutcome),
    AlreadyRunning,
}

#[derive(Clone)]
pub struct JobDispatcher {
    orchestrator: Arc<WorkflowOrchestrator>,
    active: Arc<DashSet<Uuid>>,
}

/// Releases the run's slot when the pass ends, including on panic.
struct ActiveRun {
    active: Arc<DashSet<Uuid>>,
    run_id: Uuid,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

impl JobDispatcher {
    pub fn new(orchestrator: Arc<WorkflowOrchestrator>) -> Self {
        Self {
            orchestrator,
            active: Arc::new(DashSet::new()),
        }
    }

    pub async fn dispatch(&self, run_id: Uuid, resume_from: Option<usize>) -> DispatchOutcome {
        let Some(_slot) = self.try_acquire(run_id) else {
            tracing::warn!(
                "[WORKFLOW_DISPATCHER] Run {} is already executing, ignoring duplicate delivery",
                run_id
            );
            return DispatchOutcome::AlreadyRunning;
        };

        DispatchOutcome::Executed(self.orchestrator.execute(run_id, resume_from).await)
    }

    pub fn is_running(&self, run_id: Uuid) -> bool {
        self.active.contains(&run_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn try_acquire(&self, run_id: Uuid) -> Option<ActiveRun> {
        if self.active.insert(run_id) {
            Some(ActiveRun {
                active: self.active.clone(),
                run_id,
            })
        } else {
            None
        }
    }
}
