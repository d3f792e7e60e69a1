//! Workflow runs: the persisted progress of one template execution.
//!
//! A run row is the only mutable state the orchestrator owns. Every write goes
//! through [`WorkflowRun::apply_update`], which updates only the supplied
//! columns and, when asked, checks the row's `version` so two writers can never
//! silently interleave.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use ts_rs::TS;
use utils::money::Usd;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkflowRunError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("Workflow run not found: {0}")]
    NotFound(Uuid),
    #[error("Workflow run {run_id} was modified concurrently (expected version {expected}, found {actual})")]
    VersionConflict {
        run_id: Uuid,
        expected: i64,
        actual: i64,
    },
    #[error("Corrupt workflow run row: {0}")]
    Corrupt(String),
}

const AWAITING_PREFIX: &str = "awaiting_";

/// Lifecycle of a run.
///
/// Stored as a single text column: `pending`, `running`, `awaiting_<gate>`,
/// `completed`, `failed` or `cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingGate { gate_name: String },
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn awaiting(gate_name: &str) -> Self {
        RunStatus::AwaitingGate {
            gate_name: gate_name.to_string(),
        }
    }

    /// Terminal runs are not executed again unless explicitly replayed or reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn gate_name(&self) -> Option<&str> {
        match self {
            RunStatus::AwaitingGate { gate_name } => Some(gate_name),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::AwaitingGate { gate_name } => write!(f, "{AWAITING_PREFIX}{gate_name}"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = WorkflowRunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => match other.strip_prefix(AWAITING_PREFIX) {
                Some(gate) if !gate.is_empty() => Ok(RunStatus::awaiting(gate)),
                _ => Err(WorkflowRunError::Corrupt(format!("unknown status '{other}'"))),
            },
        }
    }
}

/// Result of a phase that called the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct PhaseOutput {
    pub output: String,
    pub cost_usd: Usd,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct PhaseSkip {
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct PhaseFailure {
    pub error: String,
}

/// Per-phase record kept in `phase_results`.
///
/// Serialized untagged so the stored JSON is `{output, cost_usd, ..}`,
/// `{skipped, reason}` or `{error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(untagged)]
pub enum PhaseResult {
    Completed(PhaseOutput),
    Skipped(PhaseSkip),
    Failed(PhaseFailure),
}

impl PhaseResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        PhaseResult::Skipped(PhaseSkip {
            skipped: true,
            reason: Some(reason.into()),
        })
    }

    pub fn failed(error: impl Into<String>) -> Self {
        PhaseResult::Failed(PhaseFailure {
            error: error.into(),
        })
    }

    pub fn output(&self) -> Option<&str> {
        match self {
            PhaseResult::Completed(done) => Some(&done.output),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            PhaseResult::Failed(failure) => Some(&failure.error),
            _ => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, PhaseResult::Skipped(_))
    }
}

/// Phase name -> result. Entries are overwritten when a phase re-runs and
/// never removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(transparent)]
pub struct PhaseResults(BTreeMap<String, PhaseResult>);

impl PhaseResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, phase_name: &str, result: PhaseResult) {
        self.0.insert(phase_name.to_string(), result);
    }

    pub fn get(&self, phase_name: &str) -> Option<&PhaseResult> {
        self.0.get(phase_name)
    }

    pub fn contains(&self, phase_name: &str) -> bool {
        self.0.contains_key(phase_name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PhaseResult)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Structured data carried forward between phases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(transparent)]
pub struct Artifacts(#[ts(type = "Record<string, unknown>")] Map<String, Value>);

impl Artifacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shallow merge: each top-level key of `extracted` replaces any existing
    /// value under the same key.
    pub fn merge(&mut self, extracted: Map<String, Value>) {
        for (key, value) in extracted {
            self.0.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Artifacts {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub template_id: Uuid,
    pub site_id: Option<Uuid>,
    pub status: RunStatus,
    pub current_phase: Option<String>,
    pub current_phase_index: usize,
    pub phase_results: PhaseResults,
    pub artifacts: Artifacts,
    pub total_cost: Usd,
    #[ts(type = "unknown")]
    pub input_data: Value,
    pub error_message: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct WorkflowRunRow {
    id: Uuid,
    template_id: Uuid,
    site_id: Option<Uuid>,
    status: String,
    current_phase: Option<String>,
    current_phase_index: i64,
    phase_results: String, // JSON
    artifacts: String,     // JSON
    total_cost_nanos: i64,
    input_data: String, // JSON
    error_message: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WorkflowRunRow> for WorkflowRun {
    type Error = WorkflowRunError;

    fn try_from(row: WorkflowRunRow) -> Result<Self, Self::Error> {
        let current_phase_index = usize::try_from(row.current_phase_index).map_err(|_| {
            WorkflowRunError::Corrupt(format!(
                "negative current_phase_index {}",
                row.current_phase_index
            ))
        })?;

        Ok(WorkflowRun {
            id: row.id,
            template_id: row.template_id,
            site_id: row.site_id,
            status: row.status.parse()?,
            current_phase: row.current_phase,
            current_phase_index,
            phase_results: serde_json::from_str(&row.phase_results)?,
            artifacts: serde_json::from_str(&row.artifacts)?,
            total_cost: Usd::from_nanos(row.total_cost_nanos),
            input_data: serde_json::from_str(&row.input_data)?,
            error_message: row.error_message,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateWorkflowRun {
    pub template_id: Uuid,
    pub site_id: Option<Uuid>,
    #[ts(type = "unknown")]
    pub input_data: Value,
}

/// Partial update of a run row. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub current_phase: Option<String>,
    pub current_phase_index: Option<usize>,
    pub phase_results: Option<PhaseResults>,
    pub artifacts: Option<Artifacts>,
    pub total_cost: Option<Usd>,
    pub error_message: Option<String>,
    /// When set, the write only applies if the row is still at this version.
    pub expected_version: Option<i64>,
}

impl RunUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_phase(mut self, index: usize, name: &str) -> Self {
        self.current_phase_index = Some(index);
        self.current_phase = Some(name.to_string());
        self
    }

    pub fn with_phase_results(mut self, results: &PhaseResults) -> Self {
        self.phase_results = Some(results.clone());
        self
    }

    pub fn with_artifacts(mut self, artifacts: &Artifacts) -> Self {
        self.artifacts = Some(artifacts.clone());
        self
    }

    pub fn with_total_cost(mut self, total: Usd) -> Self {
        self.total_cost = Some(total);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn expecting_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// True when no column would change.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.current_phase.is_none()
            && self.current_phase_index.is_none()
            && self.phase_results.is_none()
            && self.artifacts.is_none()
            && self.total_cost.is_none()
            && self.error_message.is_none()
    }
}

impl WorkflowRun {
    /// Phase index an interrupted pass should continue from, or `None` when
    /// no pass was in progress.
    ///
    /// A running phase whose result is already checkpointed is not repeated.
    pub fn checkpoint_index(&self) -> Option<usize> {
        match &self.status {
            RunStatus::Running => {
                let checkpointed = self
                    .current_phase
                    .as_deref()
                    .is_some_and(|phase| self.phase_results.contains(phase));
                Some(self.current_phase_index + usize::from(checkpointed))
            }
            RunStatus::AwaitingGate { .. } => Some(self.current_phase_index),
            _ => None,
        }
    }

    /// Create a run in `pending` with empty results and zero cost.
    pub async fn create(
        pool: &SqlitePool,
        data: CreateWorkflowRun,
    ) -> Result<Self, WorkflowRunError> {
        let id = Uuid::new_v4();
        let input_str = serde_json::to_string(&data.input_data)?;

        let row = sqlx::query_as::<_, WorkflowRunRow>(
            r#"
            INSERT INTO workflow_runs (id, template_id, site_id, status, input_data)
            VALUES (?1, ?2, ?3, 'pending', ?4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.template_id)
        .bind(data.site_id)
        .bind(input_str)
        .fetch_one(pool)
        .await?;

        row.try_into()
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, WorkflowRunError> {
        let row = sqlx::query_as::<_, WorkflowRunRow>(
            r#"SELECT * FROM workflow_runs WHERE id = ?1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        row.map(WorkflowRun::try_from).transpose()
    }

    /// Runs suspended at a gate, oldest first.
    pub async fn find_awaiting_gate(pool: &SqlitePool) -> Result<Vec<Self>, WorkflowRunError> {
        let rows = sqlx::query_as::<_, WorkflowRunRow>(
            r#"
            SELECT * FROM workflow_runs
            WHERE status LIKE 'awaiting\_%' ESCAPE '\'
            ORDER BY updated_at ASC
            "#,
        )
        .fetch_all(pool)
        .await?;

        rows.into_iter().map(WorkflowRun::try_from).collect()
    }

    /// Apply a partial update and return the row's new version.
    pub async fn apply_update(
        pool: &SqlitePool,
        id: Uuid,
        update: RunUpdate,
    ) -> Result<i64, WorkflowRunError> {
        let status_str = update.status.as_ref().map(ToString::to_string);
        let index = update
            .current_phase_index
            .map(|i| i64::try_from(i).unwrap_or(i64::MAX));
        let results_str = update
            .phase_results
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let artifacts_str = update
            .artifacts
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let cost_nanos = update.total_cost.map(Usd::nanos);

        let new_version: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE workflow_runs SET
                status = COALESCE(?2, status),
                current_phase = COALESCE(?3, current_phase),
                current_phase_index = COALESCE(?4, current_phase_index),
                phase_results = COALESCE(?5, phase_results),
                artifacts = COALESCE(?6, artifacts),
                total_cost_nanos = COALESCE(?7, total_cost_nanos),
                error_message = COALESCE(?8, error_message),
                completed_at = CASE
                    WHEN ?2 IN ('completed', 'failed', 'cancelled') THEN datetime('now', 'subsec')
                    WHEN ?2 IS NOT NULL THEN NULL
                    ELSE completed_at
                END,
                version = version + 1,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND (?9 IS NULL OR version = ?9)
            RETURNING version
            "#,
        )
        .bind(id)
        .bind(status_str)
        .bind(update.current_phase)
        .bind(index)
        .bind(results_str)
        .bind(artifacts_str)
        .bind(cost_nanos)
        .bind(update.error_message)
        .bind(update.expected_version)
        .fetch_optional(pool)
        .await?;

        match (new_version, update.expected_version) {
            (Some((version,)), _) => Ok(version),
            (None, Some(expected)) => match Self::current_version(pool, id).await? {
                Some(actual) => Err(WorkflowRunError::VersionConflict {
                    run_id: id,
                    expected,
                    actual,
                }),
                None => Err(WorkflowRunError::NotFound(id)),
            },
            (None, None) => Err(WorkflowRunError::NotFound(id)),
        }
    }

    async fn current_version(pool: &SqlitePool, id: Uuid) -> Result<Option<i64>, WorkflowRunError> {
        let row: Option<(i64,)> =
            sqlx::query_as(r#"SELECT version FROM workflow_runs WHERE id = ?1"#)
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    /// Record an external cancellation. Returns false if the run was already terminal.
    pub async fn cancel(pool: &SqlitePool, id: Uuid) -> Result<bool, WorkflowRunError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'cancelled',
                completed_at = datetime('now', 'subsec'),
                version = version + 1,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Put a terminal run back to `pending` so it can be executed again.
    ///
    /// Results, artifacts and accumulated cost are kept.
    pub async fn reset(pool: &SqlitePool, id: Uuid) -> Result<bool, WorkflowRunError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'pending',
                error_message = NULL,
                completed_at = NULL,
                version = version + 1,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_utils::{create_test_run, setup_test_pool};
    use serde_json::json;

    #[test]
    fn test_status_storage_encoding() {
        assert_eq!(RunStatus::awaiting("review").to_string(), "awaiting_review");
        assert_eq!(
            "awaiting_final_sign_off".parse::<RunStatus>().unwrap(),
            RunStatus::awaiting("final_sign_off")
        );
        assert_eq!("completed".parse::<RunStatus>().unwrap(), RunStatus::Completed);
        assert!("awaiting_".parse::<RunStatus>().is_err());
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_phase_result_json_shapes() {
        let skipped = serde_json::to_value(PhaseResult::skipped("no skill")).unwrap();
        assert_eq!(skipped, json!({"skipped": true, "reason": "no skill"}));

        let failed = serde_json::to_value(PhaseResult::failed("timeout")).unwrap();
        assert_eq!(failed, json!({"error": "timeout"}));

        let done: PhaseResult = serde_json::from_value(json!({
            "output": "hello",
            "cost_usd": "0.002",
            "input_tokens": 10,
            "output_tokens": 5,
            "model": "claude-sonnet-4",
            "duration_ms": 120
        }))
        .unwrap();
        assert_eq!(done.output(), Some("hello"));

        let back: PhaseResult = serde_json::from_value(failed).unwrap();
        assert_eq!(back.error(), Some("timeout"));
    }

    #[test]
    fn test_artifact_merge_later_keys_win() {
        let mut artifacts = Artifacts::new();
        artifacts.merge(json!({"x": 1}).as_object().cloned().unwrap());
        artifacts.merge(json!({"x": 2, "y": 3}).as_object().cloned().unwrap());
        assert_eq!(serde_json::to_value(&artifacts).unwrap(), json!({"x": 2, "y": 3}));
    }

    #[tokio::test]
    async fn test_create_starts_pending_and_empty() {
        let pool = setup_test_pool().await;
        let run = create_test_run(&pool, json!({"topic": "rust"})).await;

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.current_phase_index, 0);
        assert!(run.phase_results.is_empty());
        assert!(run.artifacts.is_empty());
        assert_eq!(run.total_cost, Usd::ZERO);
        assert_eq!(run.input_data, json!({"topic": "rust"}));
        assert_eq!(run.version, 0);
    }

    #[tokio::test]
    async fn test_partial_update_leaves_other_columns() {
        let pool = setup_test_pool().await;
        let run = create_test_run(&pool, json!({})).await;

        let mut results = PhaseResults::new();
        results.record("plan", PhaseResult::skipped("no skill"));
        WorkflowRun::apply_update(
            &pool,
            run.id,
            RunUpdate::new()
                .with_phase_results(&results)
                .with_total_cost(Usd::from_nanos(42)),
        )
        .await
        .unwrap();

        let version = WorkflowRun::apply_update(
            &pool,
            run.id,
            RunUpdate::new()
                .with_status(RunStatus::awaiting("review"))
                .with_phase(1, "review"),
        )
        .await
        .unwrap();
        assert_eq!(version, 2);

        let reloaded = WorkflowRun::find_by_id(&pool, run.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, RunStatus::awaiting("review"));
        assert_eq!(reloaded.current_phase.as_deref(), Some("review"));
        assert_eq!(reloaded.current_phase_index, 1);
        assert!(reloaded.phase_results.get("plan").unwrap().is_skipped());
        assert_eq!(reloaded.total_cost, Usd::from_nanos(42));
        assert!(reloaded.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let pool = setup_test_pool().await;
        let run = create_test_run(&pool, json!({})).await;

        WorkflowRun::apply_update(
            &pool,
            run.id,
            RunUpdate::new().with_status(RunStatus::Running).expecting_version(0),
        )
        .await
        .unwrap();

        let err = WorkflowRun::apply_update(
            &pool,
            run.id,
            RunUpdate::new().with_total_cost(Usd::from_nanos(1)).expecting_version(0),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            WorkflowRunError::VersionConflict { expected: 0, actual: 1, .. }
        ));
        let reloaded = WorkflowRun::find_by_id(&pool, run.id).await.unwrap().unwrap();
        assert_eq!(reloaded.total_cost, Usd::ZERO);
    }

    #[tokio::test]
    async fn test_update_missing_run() {
        let pool = setup_test_pool().await;
        let err = WorkflowRun::apply_update(&pool, Uuid::new_v4(), RunUpdate::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowRunError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_and_reset() {
        let pool = setup_test_pool().await;
        let run = create_test_run(&pool, json!({})).await;

        assert!(!WorkflowRun::reset(&pool, run.id).await.unwrap());
        assert!(WorkflowRun::cancel(&pool, run.id).await.unwrap());
        assert!(!WorkflowRun::cancel(&pool, run.id).await.unwrap());

        let cancelled = WorkflowRun::find_by_id(&pool, run.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        assert!(WorkflowRun::reset(&pool, run.id).await.unwrap());
        let reset = WorkflowRun::find_by_id(&pool, run.id).await.unwrap().unwrap();
        assert_eq!(reset.status, RunStatus::Pending);
        assert!(reset.completed_at.is_none());
        assert_eq!(reset.version, 2);
    }

    #[tokio::test]
    async fn test_replay_clears_completed_at() {
        let pool = setup_test_pool().await;
        let run = create_test_run(&pool, json!({})).await;

        WorkflowRun::apply_update(&pool, run.id, RunUpdate::new().with_status(RunStatus::Completed))
            .await
            .unwrap();
        let done = WorkflowRun::find_by_id(&pool, run.id).await.unwrap().unwrap();
        assert!(done.completed_at.is_some());

        // Checkpoints without a status leave it alone.
        WorkflowRun::apply_update(&pool, run.id, RunUpdate::new().with_total_cost(Usd::from_nanos(5)))
            .await
            .unwrap();
        let still_done = WorkflowRun::find_by_id(&pool, run.id).await.unwrap().unwrap();
        assert_eq!(still_done.completed_at, done.completed_at);

        WorkflowRun::apply_update(
            &pool,
            run.id,
            RunUpdate::new().with_status(RunStatus::Running).with_phase(0, "plan"),
        )
        .await
        .unwrap();
        let replaying = WorkflowRun::find_by_id(&pool, run.id).await.unwrap().unwrap();
        assert_eq!(replaying.status, RunStatus::Running);
        assert!(replaying.completed_at.is_none());
    }

    #[test]
    fn test_checkpoint_index_skips_checkpointed_phase() {
        let now = Utc::now();
        let mut run = WorkflowRun {
            id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            site_id: None,
            status: RunStatus::Running,
            current_phase: Some("draft".to_string()),
            current_phase_index: 1,
            phase_results: PhaseResults::new(),
            artifacts: Artifacts::new(),
            total_cost: Usd::ZERO,
            input_data: json!({}),
            error_message: None,
            version: 3,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        assert_eq!(run.checkpoint_index(), Some(1));

        run.phase_results.record("draft", PhaseResult::failed("timeout"));
        assert_eq!(run.checkpoint_index(), Some(2));

        run.status = RunStatus::awaiting("review");
        assert_eq!(run.checkpoint_index(), Some(1));

        run.status = RunStatus::Completed;
        assert_eq!(run.checkpoint_index(), None);
        run.status = RunStatus::Pending;
        assert_eq!(run.checkpoint_index(), None);
    }

    #[tokio::test]
    async fn test_find_awaiting_gate() {
        let pool = setup_test_pool().await;
        let waiting = create_test_run(&pool, json!({})).await;
        let _idle = create_test_run(&pool, json!({})).await;

        WorkflowRun::apply_update(
            &pool,
            waiting.id,
            RunUpdate::new().with_status(RunStatus::awaiting("review")),
        )
        .await
        .unwrap();

        let found = WorkflowRun::find_awaiting_gate(&pool).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, waiting.id);
    }
}
