//! Progress notifications.
//!
//! Reports are fire-and-forget: the orchestrator never waits on or reacts to
//! a reporter, so implementations must not block.

use chrono::{DateTime, Utc};
use db::models::workflow_run::{Artifacts, PhaseResults};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ts_rs::TS;
use utils::money::Usd;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub run_id: Uuid,
    pub phase_index: usize,
    pub total_phases: usize,
    pub phase_name: String,
    /// Set when this phase is a gate and the run is about to suspend.
    pub gate_label: Option<String>,
    pub is_gate: bool,
    pub phase_results: PhaseResults,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionReport {
    pub run_id: Uuid,
    pub total_phases: usize,
    pub total_cost: Usd,
    pub duration_ms: u64,
    pub artifacts: Artifacts,
    /// Start of the last phase output, bounded in length.
    pub output_preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub run_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancellationReport {
    pub run_id: Uuid,
    /// Index of the phase that would have run next.
    pub phase_index: usize,
}

pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, report: &ProgressReport);
    fn on_complete(&self, report: &CompletionReport);
    fn on_failure(&self, report: &FailureReport);
    fn on_cancelled(&self, report: &CancellationReport);
}

/// Events emitted for every run the worker touches.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowEvent {
    PhaseStarted {
        run_id: Uuid,
        phase_index: usize,
        total_phases: usize,
        phase_name: String,
        completed_phases: usize,
        timestamp: DateTime<Utc>,
    },

    GateReached {
        run_id: Uuid,
        phase_index: usize,
        gate_name: String,
        gate_label: Option<String>,
        timestamp: DateTime<Utc>,
    },

    Completed {
        run_id: Uuid,
        total_phases: usize,
        total_cost_usd: Usd,
        duration_ms: u64,
        artifact_count: usize,
        output_preview: Option<String>,
        timestamp: DateTime<Utc>,
    },

    Failed {
        run_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },

    Cancelled {
        run_id: Uuid,
        phase_index: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcasts [`WorkflowEvent`]s to any number of subscribers and logs each one.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000);
        Self { sender }
    }

    pub fn broadcast(&self, event: WorkflowEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for EventBroadcaster {
    fn on_progress(&self, report: &ProgressReport) {
        if report.is_gate {
            tracing::info!(
                "[WORKFLOW_ORCHESTRATOR] Run {} awaiting gate '{}' ({}/{})",
                report.run_id,
                report.phase_name,
                report.phase_index + 1,
                report.total_phases
            );
            self.broadcast(WorkflowEvent::GateReached {
                run_id: report.run_id,
                phase_index: report.phase_index,
                gate_name: report.phase_name.clone(),
                gate_label: report.gate_label.clone(),
                timestamp: Utc::now(),
            });
        } else {
            tracing::info!(
                "[WORKFLOW_ORCHESTRATOR] Run {} phase {}/{}: {}",
                report.run_id,
                report.phase_index + 1,
                report.total_phases,
                report.phase_name
            );
            self.broadcast(WorkflowEvent::PhaseStarted {
                run_id: report.run_id,
                phase_index: report.phase_index,
                total_phases: report.total_phases,
                phase_name: report.phase_name.clone(),
                completed_phases: report.phase_results.len(),
                timestamp: Utc::now(),
            });
        }
    }

    fn on_complete(&self, report: &CompletionReport) {
        tracing::info!(
            "[WORKFLOW_ORCHESTRATOR] Run {} completed: {} phases, ${} in {}ms",
            report.run_id,
            report.total_phases,
            report.total_cost,
            report.duration_ms
        );
        self.broadcast(WorkflowEvent::Completed {
            run_id: report.run_id,
            total_phases: report.total_phases,
            total_cost_usd: report.total_cost,
            duration_ms: report.duration_ms,
            artifact_count: report.artifacts.len(),
            output_preview: report.output_preview.clone(),
            timestamp: Utc::now(),
        });
    }

    fn on_failure(&self, report: &FailureReport) {
        tracing::error!(
            "[WORKFLOW_ORCHESTRATOR] Run {} failed: {}",
            report.run_id,
            report.message
        );
        self.broadcast(WorkflowEvent::Failed {
            run_id: report.run_id,
            error: report.message.clone(),
            timestamp: Utc::now(),
        });
    }

    fn on_cancelled(&self, report: &CancellationReport) {
        tracing::info!(
            "[WORKFLOW_ORCHESTRATOR] Run {} cancelled before phase {}",
            report.run_id,
            report.phase_index
        );
        self.broadcast(WorkflowEvent::Cancelled {
            run_id: report.run_id,
            phase_index: report.phase_index,
            timestamp: Utc::now(),
        });
    }
}
