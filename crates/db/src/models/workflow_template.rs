//! Workflow templates: the ordered phase lists a run executes.
//!
//! Templates are data only. The orchestrator loads one per run and never
//! mutates it.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkflowTemplateError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("Workflow template not found")]
    NotFound,
    #[error("Template has a phase with an empty name at index {0}")]
    EmptyPhaseName(usize),
    #[error("Duplicate phase name in template: {0}")]
    DuplicatePhase(String),
}

/// One step of a template: either a skill invocation or a human gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct PhaseDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    #[serde(default)]
    pub is_gate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_label: Option<String>,
    /// Phase-specific settings; opaque to the engine.
    #[serde(default)]
    #[ts(type = "Record<string, unknown>")]
    pub config: Map<String, Value>,
}

impl PhaseDefinition {
    pub fn skill(name: &str, skill_ref: &str) -> Self {
        Self {
            name: name.to_string(),
            skill_ref: Some(skill_ref.to_string()),
            model_override: None,
            is_gate: false,
            gate_label: None,
            config: Map::new(),
        }
    }

    pub fn gate(name: &str, label: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            skill_ref: None,
            model_override: None,
            is_gate: true,
            gate_label: label.map(str::to_string),
            config: Map::new(),
        }
    }

    /// A phase with no skill; the orchestrator records it as skipped.
    pub fn placeholder(name: &str) -> Self {
        Self {
            name: name.to_string(),
            skill_ref: None,
            model_override: None,
            is_gate: false,
            gate_label: None,
            config: Map::new(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model_override = Some(model.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct WorkflowTemplate {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub default_model: Option<String>,
    pub phases: Vec<PhaseDefinition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct WorkflowTemplateRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    default_model: Option<String>,
    phases: String, // JSON
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkflowTemplateRow> for WorkflowTemplate {
    type Error = WorkflowTemplateError;

    fn try_from(row: WorkflowTemplateRow) -> Result<Self, Self::Error> {
        let template = WorkflowTemplate {
            id: row.id,
            name: row.name,
            description: row.description,
            default_model: row.default_model,
            phases: serde_json::from_str(&row.phases)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        };
        template.validate()?;
        Ok(template)
    }
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateWorkflowTemplate {
    pub name: String,
    pub description: Option<String>,
    pub default_model: Option<String>,
    pub phases: Vec<PhaseDefinition>,
}

/// Phase names key `phase_results`, so they must be unique and non-empty.
fn validate_phases(phases: &[PhaseDefinition]) -> Result<(), WorkflowTemplateError> {
    let mut seen = HashSet::new();
    for (index, phase) in phases.iter().enumerate() {
        if phase.name.trim().is_empty() {
            return Err(WorkflowTemplateError::EmptyPhaseName(index));
        }
        if !seen.insert(phase.name.as_str()) {
            return Err(WorkflowTemplateError::DuplicatePhase(phase.name.clone()));
        }
    }
    Ok(())
}

impl WorkflowTemplate {
    pub fn validate(&self) -> Result<(), WorkflowTemplateError> {
        validate_phases(&self.phases)
    }

    pub async fn create(
        pool: &SqlitePool,
        data: CreateWorkflowTemplate,
    ) -> Result<Self, WorkflowTemplateError> {
        validate_phases(&data.phases)?;

        let id = Uuid::new_v4();
        let phases_str = serde_json::to_string(&data.phases)?;

        let row = sqlx::query_as::<_, WorkflowTemplateRow>(
            r#"
            INSERT INTO workflow_templates (id, name, description, default_model, phases)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&data.name)
        .bind(&data.description)
        .bind(&data.default_model)
        .bind(phases_str)
        .fetch_one(pool)
        .await?;

        row.try_into()
    }

    /// Find by ID. A stored template that fails validation is an error, not `None`.
    pub async fn find_by_id(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<Self>, WorkflowTemplateError> {
        let row = sqlx::query_as::<_, WorkflowTemplateRow>(
            r#"SELECT * FROM workflow_templates WHERE id = ?1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        row.map(WorkflowTemplate::try_from).transpose()
    }
}
