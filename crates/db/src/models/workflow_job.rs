//! Durable execution queue.
//!
//! A job asks the worker to run (or resume) one workflow run. Jobs are
//! claimed one at a time with a single conditional UPDATE so two pollers
//! never pick the same row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "workflow_job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Claimed,
    Done,
    Failed,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct WorkflowJob {
    pub id: Uuid,
    pub run_id: Uuid,
    pub resume_from_phase_index: Option<i64>,
    pub status: JobStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowJob {
    pub fn resume_index(&self) -> Option<usize> {
        self.resume_from_phase_index
            .and_then(|i| usize::try_from(i).ok())
    }

    pub async fn enqueue(
        pool: &SqlitePool,
        run_id: Uuid,
        resume_from_phase_index: Option<usize>,
    ) -> Result<Self, sqlx::Error> {
        let id = Uuid::new_v4();
        let resume = resume_from_phase_index.and_then(|i| i64::try_from(i).ok());
        sqlx::query_as::<_, WorkflowJob>(
            r#"
            INSERT INTO workflow_jobs (id, run_id, resume_from_phase_index, status)
            VALUES (?1, ?2, ?3, 'queued')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(run_id)
        .bind(resume)
        .fetch_one(pool)
        .await
    }

    /// Claim the oldest queued job, if any.
    pub async fn claim_next(pool: &SqlitePool) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowJob>(
            r#"
            UPDATE workflow_jobs
            SET status = 'claimed',
                attempts = attempts + 1,
                claimed_at = datetime('now', 'subsec')
            WHERE id = (
                SELECT id FROM workflow_jobs
                WHERE status = 'queued'
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
            ) AND status = 'queued'
            RETURNING *
            "#,
        )
        .fetch_optional(pool)
        .await
    }

    pub async fn mark_done(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE workflow_jobs
            SET status = 'done', last_error = NULL, finished_at = datetime('now', 'subsec')
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(pool: &SqlitePool, id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE workflow_jobs
            SET status = 'failed', last_error = ?2, finished_at = datetime('now', 'subsec')
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Jobs left `claimed`, i.e. by a worker that stopped mid-pass.
    pub async fn find_claimed(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowJob>(
            r#"SELECT * FROM workflow_jobs WHERE status = 'claimed' ORDER BY created_at ASC, rowid ASC"#,
        )
        .fetch_all(pool)
        .await
    }

    /// Put a claimed job back in the queue, starting at `resume_from_phase_index`.
    pub async fn requeue(
        pool: &SqlitePool,
        id: Uuid,
        resume_from_phase_index: Option<usize>,
    ) -> Result<(), sqlx::Error> {
        let resume = resume_from_phase_index.and_then(|i| i64::try_from(i).ok());
        sqlx::query(
            r#"
            UPDATE workflow_jobs
            SET status = 'queued', claimed_at = NULL, resume_from_phase_index = ?2
            WHERE id = ?1 AND status = 'claimed'
            "#,
        )
        .bind(id)
        .bind(resume)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_run(pool: &SqlitePool, run_id: Uuid) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowJob>(
            r#"SELECT * FROM workflow_jobs WHERE run_id = ?1 ORDER BY created_at ASC, rowid ASC"#,
        )
        .bind(run_id)
        .fetch_all(pool)
        .await
    }
}
