//! Workflow Scheduler - drains the job queue into the dispatcher
//!
//! Jobs are claimed from `workflow_jobs` on a fixed poll interval. At most
//! `max_concurrent_runs` passes execute at once; further jobs stay queued
//! until a slot frees up.

use std::{sync::Arc, time::Duration};

use db::{
    DBService,
    models::{workflow_job::WorkflowJob, workflow_run::WorkflowRun},
};
use services::services::workflow::{DispatchOutcome, ExecutionOutcome, JobDispatcher};
use tokio::{
    sync::{Notify, Semaphore},
    task::JoinHandle,
};
use tracing::{error, info, warn};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSchedulerConfig {
    /// How often to check the queue (in seconds)
    pub poll_interval_secs: u64,
    /// Maximum passes executing at the same time
    pub max_concurrent_runs: usize,
}

impl Default for WorkflowSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
        }
    }
}

impl WorkflowSchedulerConfig {
    pub fn from_env() -> Self {
        let poll_interval_secs = std::env::var("WORKFLOW_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        let max_concurrent_runs = std::env::var("WORKFLOW_MAX_CONCURRENT_RUNS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_RUNS);

        Self {
            poll_interval_secs,
            max_concurrent_runs,
        }
    }
}

pub struct WorkflowScheduler {
    db: DBService,
    dispatcher: JobDispatcher,
    config: WorkflowSchedulerConfig,
    slots: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl WorkflowScheduler {
    pub fn new(db: DBService, dispatcher: JobDispatcher, config: WorkflowSchedulerConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            db,
            dispatcher,
            config,
            slots,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Poll until [`WorkflowScheduler::stop`] is called, then wait for
    /// in-flight passes to finish.
    pub async fn run(&self) -> Result<(), sqlx::Error> {
        let requeued = self.recover_claimed().await?;
        if requeued > 0 {
            warn!(
                "[WORKFLOW_SCHEDULER] Requeued {} job(s) left claimed by a previous worker",
                requeued
            );
        }

        info!(
            "[WORKFLOW_SCHEDULER] Started - polling every {}s, up to {} concurrent runs",
            self.config.poll_interval_secs, self.config.max_concurrent_runs
        );

        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
        let interval = Duration::from_secs(self.config.poll_interval_secs);

        loop {
            in_flight.retain(|handle| !handle.is_finished());
            match self.tick().await {
                Ok(handles) => in_flight.extend(handles),
                Err(e) => error!("[WORKFLOW_SCHEDULER] Error processing queue: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.notified() => break,
            }
        }

        info!(
            "[WORKFLOW_SCHEDULER] Stopping - waiting for {} in-flight run(s)",
            in_flight.len()
        );
        for handle in in_flight {
            if let Err(e) = handle.await {
                error!("[WORKFLOW_SCHEDULER] Run task panicked: {}", e);
            }
        }
        info!("[WORKFLOW_SCHEDULER] Stopped");
        Ok(())
    }

    /// Requeue jobs a previous worker claimed but never finished.
    ///
    /// A job whose run was interrupted mid-pass resumes from the run's last
    /// checkpoint rather than its original index, so phases that already
    /// finished are not invoked (or billed) again.
    pub async fn recover_claimed(&self) -> Result<usize, sqlx::Error> {
        let claimed = WorkflowJob::find_claimed(&self.db.pool).await?;
        for job in &claimed {
            let checkpoint = WorkflowRun::find_by_id(&self.db.pool, job.run_id)
                .await
                .map_err(|e| {
                    warn!(
                        "[WORKFLOW_SCHEDULER] Could not load run {} for job {}: {}",
                        job.run_id, job.id, e
                    );
                })
                .ok()
                .flatten()
                .and_then(|run| run.checkpoint_index());

            let resume = match (job.resume_index(), checkpoint) {
                (Some(requested), Some(reached)) => Some(requested.max(reached)),
                (requested, reached) => reached.or(requested),
            };
            if resume != job.resume_index() {
                info!(
                    "[WORKFLOW_SCHEDULER] Job {} for run {} resumes at phase {:?} (was {:?})",
                    job.id,
                    job.run_id,
                    resume,
                    job.resume_index()
                );
            }
            WorkflowJob::requeue(&self.db.pool, job.id, resume).await?;
        }
        Ok(claimed.len())
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// Claim as many queued jobs as there are free slots and start them.
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>, sqlx::Error> {
        let mut handles = Vec::new();

        loop {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            let Some(job) = WorkflowJob::claim_next(&self.db.pool).await? else {
                break;
            };

            info!(
                "[WORKFLOW_SCHEDULER] Claimed job {} for run {} (attempt {})",
                job.id, job.run_id, job.attempts
            );

            let pool = self.db.pool.clone();
            let dispatcher = self.dispatcher.clone();
            handles.push(tokio::spawn(async move {
                let outcome = dispatcher.dispatch(job.run_id, job.resume_index()).await;
                finish_job(&pool, &job, &outcome).await;
                drop(permit);
            }));
        }

        Ok(handles)
    }
}

async fn finish_job(pool: &sqlx::SqlitePool, job: &WorkflowJob, outcome: &DispatchOutcome) {
    let result = match outcome {
        DispatchOutcome::Executed(ExecutionOutcome::Failed { message }) => {
            WorkflowJob::mark_failed(pool, job.id, message).await
        }
        DispatchOutcome::Executed(ExecutionOutcome::Conflict) => {
            WorkflowJob::mark_failed(pool, job.id, "run was modified by another writer").await
        }
        DispatchOutcome::AlreadyRunning => {
            WorkflowJob::mark_failed(pool, job.id, "run is already executing").await
        }
        DispatchOutcome::Executed(outcome) => {
            info!("[WORKFLOW_SCHEDULER] Job {} finished: {:?}", job.id, outcome);
            WorkflowJob::mark_done(pool, job.id).await
        }
    };

    if let Err(e) = result {
        error!(
            "[WORKFLOW_SCHEDULER] Failed to record outcome of job {}: {}",
            job.id, e
        );
    }
}
