use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// Reusable instruction set a phase runs as its system prompt.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Skill {
    pub id: Uuid,
    pub skill_ref: String,
    pub system_prompt: String,
    pub token_budget_hint: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateSkill {
    pub skill_ref: String,
    pub system_prompt: String,
    pub token_budget_hint: Option<i64>,
}

impl Skill {
    pub async fn create(pool: &SqlitePool, data: CreateSkill) -> Result<Self, sqlx::Error> {
        let id = Uuid::new_v4();
        sqlx::query_as::<_, Skill>(
            r#"
            INSERT INTO workflow_skills (id, skill_ref, system_prompt, token_budget_hint)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.skill_ref)
        .bind(data.system_prompt)
        .bind(data.token_budget_hint)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_ref(pool: &SqlitePool, skill_ref: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Skill>(r#"SELECT * FROM workflow_skills WHERE skill_ref = ?1"#)
            .bind(skill_ref)
            .fetch_optional(pool)
            .await
    }
}
