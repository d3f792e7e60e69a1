//! workflow-worker - executes multi-phase workflow runs
//!
//! `serve` drains the job queue until interrupted; `run` executes a single
//! pass in the foreground. `enqueue`, `cancel`, `reset` and `gates` are
//! small operator commands against the same database.

mod scheduler;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use db::{
    DBService,
    models::{workflow_job::WorkflowJob, workflow_run::WorkflowRun},
};
use scheduler::{WorkflowScheduler, WorkflowSchedulerConfig};
use services::services::workflow::{
    DispatchOutcome, ExecutionOutcome, JobDispatcher, OrchestratorConfig, WorkflowOrchestrator,
    config::GatewayConfig,
    invoker::{GatewayInvoker, InvokeError, ModelInvoker},
    progress::{EventBroadcaster, ProgressReporter},
    skills::DbSkillLoader,
    store::SqliteWorkflowStore,
};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, prelude::*};
use utils::sentry::sentry_layer;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Gateway(#[from] InvokeError),
    #[error("Workflow run not found: {0}")]
    RunNotFound(Uuid),
    #[error("Workflow run {0} is not in a state that allows this")]
    InvalidState(Uuid),
    #[error("Workflow run failed: {0}")]
    RunFailed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Multi-phase workflow worker
#[derive(Parser)]
#[command(name = "workflow-worker")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Executes template-driven agent workflows with gates and checkpoints")]
struct Cli {
    /// SQLite database URL (defaults to the asset directory)
    #[arg(long, env = "WORKFLOW_DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the job queue and execute runs until Ctrl-C
    Serve,
    /// Execute one pass of a run in the foreground
    Run {
        run_id: Uuid,
        /// Phase index to start from (re-runs that phase)
        #[arg(long)]
        resume_from: Option<usize>,
    },
    /// Queue a run for the serving worker
    Enqueue {
        run_id: Uuid,
        #[arg(long)]
        resume_from: Option<usize>,
    },
    /// Cancel a run; an executing pass stops before its next phase
    Cancel { run_id: Uuid },
    /// Return a completed, failed or cancelled run to pending
    Reset { run_id: Uuid },
    /// List runs suspended at a gate and the index to resume them from
    Gates,
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    dotenv::dotenv().ok();
    let _sentry = utils::sentry::init_from_env();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,worker={level},services={level},db={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).map_err(anyhow::Error::from)?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .with(sentry_layer())
        .init();

    let cli = Cli::parse();
    let db = match &cli.database_url {
        Some(url) => DBService::new_with_url(url).await?,
        None => DBService::new().await?,
    };

    match cli.command {
        Command::Serve => serve(db).await,
        Command::Run {
            run_id,
            resume_from,
        } => run_once(db, run_id, resume_from).await,
        Command::Enqueue {
            run_id,
            resume_from,
        } => {
            ensure_run_exists(&db, run_id).await?;
            let job = WorkflowJob::enqueue(&db.pool, run_id, resume_from).await?;
            tracing::info!("Queued job {} for run {}", job.id, run_id);
            Ok(())
        }
        Command::Cancel { run_id } => {
            ensure_run_exists(&db, run_id).await?;
            if !WorkflowRun::cancel(&db.pool, run_id).await.map_err(anyhow::Error::from)? {
                return Err(WorkerError::InvalidState(run_id));
            }
            tracing::info!("Cancelled run {}", run_id);
            Ok(())
        }
        Command::Reset { run_id } => {
            ensure_run_exists(&db, run_id).await?;
            if !WorkflowRun::reset(&db.pool, run_id).await.map_err(anyhow::Error::from)? {
                return Err(WorkerError::InvalidState(run_id));
            }
            tracing::info!("Reset run {} to pending", run_id);
            Ok(())
        }
        Command::Gates => list_gates(&db).await,
    }
}

/// Wire the SQLite store, skill loader, model invoker and reporter into a dispatcher.
pub(crate) fn build_dispatcher(
    db: DBService,
    invoker: Arc<dyn ModelInvoker>,
    reporter: Arc<dyn ProgressReporter>,
    config: OrchestratorConfig,
) -> JobDispatcher {
    let store = Arc::new(SqliteWorkflowStore::new(db.clone()));
    let orchestrator = WorkflowOrchestrator::new(
        store.clone(),
        store,
        Arc::new(DbSkillLoader::new(db)),
        invoker,
        reporter,
        config,
    );
    JobDispatcher::new(Arc::new(orchestrator))
}

fn gateway_dispatcher(db: DBService) -> Result<JobDispatcher, WorkerError> {
    let gateway = GatewayConfig::from_env();
    tracing::info!("Using model gateway at {}", gateway.base_url);
    let invoker = GatewayInvoker::new(&gateway.base_url, gateway.api_key, gateway.timeout)?;

    Ok(build_dispatcher(
        db,
        Arc::new(invoker),
        Arc::new(EventBroadcaster::new()),
        OrchestratorConfig::from_env(),
    ))
}

async fn serve(db: DBService) -> Result<(), WorkerError> {
    let dispatcher = gateway_dispatcher(db.clone())?;
    let scheduler = Arc::new(WorkflowScheduler::new(
        db,
        dispatcher,
        WorkflowSchedulerConfig::from_env(),
    ));

    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    scheduler.stop();

    runner
        .await
        .map_err(|e| anyhow::anyhow!("scheduler task failed: {e}"))??;
    Ok(())
}

async fn run_once(
    db: DBService,
    run_id: Uuid,
    resume_from: Option<usize>,
) -> Result<(), WorkerError> {
    ensure_run_exists(&db, run_id).await?;
    let dispatcher = gateway_dispatcher(db)?;

    match dispatcher.dispatch(run_id, resume_from).await {
        DispatchOutcome::Executed(ExecutionOutcome::Failed { message }) => {
            Err(WorkerError::RunFailed(message))
        }
        DispatchOutcome::Executed(outcome) => {
            tracing::info!("Run {} finished pass: {:?}", run_id, outcome);
            Ok(())
        }
        DispatchOutcome::AlreadyRunning => Err(WorkerError::InvalidState(run_id)),
    }
}

async fn list_gates(db: &DBService) -> Result<(), WorkerError> {
    let runs = WorkflowRun::find_awaiting_gate(&db.pool)
        .await
        .map_err(anyhow::Error::from)?;
    if runs.is_empty() {
        tracing::info!("No runs are waiting at a gate");
    }
    for run in runs {
        tracing::info!(
            "Run {} awaiting '{}' since {}; resume with --resume-from {}",
            run.id,
            run.status.gate_name().unwrap_or_default(),
            run.updated_at,
            run.current_phase_index + 1
        );
    }
    Ok(())
}

async fn ensure_run_exists(db: &DBService, run_id: Uuid) -> Result<(), WorkerError> {
    WorkflowRun::find_by_id(&db.pool, run_id)
        .await
        .map_err(anyhow::Error::from)?
        .map(|_| ())
        .ok_or(WorkerError::RunNotFound(run_id))
}
