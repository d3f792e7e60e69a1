//! Persistence seams used by the orchestrator.

use async_trait::async_trait;
use db::{
    DBService,
    models::{
        site_config::SiteConfig,
        workflow_run::{RunUpdate, WorkflowRun},
        workflow_template::WorkflowTemplate,
    },
};
use uuid::Uuid;

use super::error::StoreError;

/// Durable run state. `save` is a partial update: only the fields set on the
/// [`RunUpdate`] are written. It returns the run's new version.
#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn load(&self, run_id: Uuid) -> Result<Option<WorkflowRun>, StoreError>;

    async fn save(&self, run_id: Uuid, update: RunUpdate) -> Result<i64, StoreError>;
}

/// Read-only lookups for the data a run refers to.
#[async_trait]
pub trait WorkflowCatalog: Send + Sync {
    async fn template(&self, template_id: Uuid) -> Result<Option<WorkflowTemplate>, StoreError>;

    async fn site(&self, site_id: Uuid) -> Result<Option<SiteConfig>, StoreError>;
}

/// SQLite-backed store and catalog.
#[derive(Clone)]
pub struct SqliteWorkflowStore {
    db: DBService,
}

impl SqliteWorkflowStore {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RunStateStore for SqliteWorkflowStore {
    async fn load(&self, run_id: Uuid) -> Result<Option<WorkflowRun>, StoreError> {
        Ok(WorkflowRun::find_by_id(&self.db.pool, run_id).await?)
    }

    async fn save(&self, run_id: Uuid, update: RunUpdate) -> Result<i64, StoreError> {
        Ok(WorkflowRun::apply_update(&self.db.pool, run_id, update).await?)
    }
}

#[async_trait]
impl WorkflowCatalog for SqliteWorkflowStore {
    async fn template(&self, template_id: Uuid) -> Result<Option<WorkflowTemplate>, StoreError> {
        Ok(WorkflowTemplate::find_by_id(&self.db.pool, template_id).await?)
    }

    async fn site(&self, site_id: Uuid) -> Result<Option<SiteConfig>, StoreError> {
        Ok(SiteConfig::find_by_id(&self.db.pool, site_id).await?)
    }
}
