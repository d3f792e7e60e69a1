use serde_json::Value;
use sqlx::SqlitePool;

use super::site_config::{CreateSiteConfig, SiteConfig};
use super::workflow_run::{CreateWorkflowRun, WorkflowRun};
use super::workflow_template::{CreateWorkflowTemplate, PhaseDefinition, WorkflowTemplate};
use crate::DBService;

pub(crate) async fn setup_test_pool() -> SqlitePool {
    DBService::new_in_memory()
        .await
        .expect("failed to open sqlite memory db")
        .pool
}

pub(crate) async fn create_test_template(pool: &SqlitePool) -> WorkflowTemplate {
    WorkflowTemplate::create(
        pool,
        CreateWorkflowTemplate {
            name: "Test Template".to_string(),
            description: None,
            default_model: None,
            phases: vec![
                PhaseDefinition::skill("research", "researcher"),
                PhaseDefinition::gate("review", Some("Approve research")),
                PhaseDefinition::skill("draft", "writer"),
            ],
        },
    )
    .await
    .expect("failed to create template")
}

pub(crate) async fn create_test_site(pool: &SqlitePool) -> SiteConfig {
    SiteConfig::create(
        pool,
        CreateSiteConfig {
            name: "Example Blog".to_string(),
            url: "https://blog.example.com".to_string(),
            platform: Some("wordpress".to_string()),
            username: Some("editor".to_string()),
            app_password: Some("s3cret".to_string()),
        },
    )
    .await
    .expect("failed to create site")
}

pub(crate) async fn create_test_run(pool: &SqlitePool, input_data: Value) -> WorkflowRun {
    let template = create_test_template(pool).await;
    WorkflowRun::create(
        pool,
        CreateWorkflowRun {
            template_id: template.id,
            site_id: None,
            input_data,
        },
    )
    .await
    .expect("failed to create run")
}
