use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// Publishing target a run may be bound to.
///
/// `app_password` is never serialized or logged.
#[derive(Clone, FromRow, Serialize, Deserialize, TS)]
pub struct SiteConfig {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub platform: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing, default)]
    #[ts(skip)]
    pub app_password: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for SiteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("platform", &self.platform)
            .field("username", &self.username)
            .field("app_password", &self.app_password.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

#[derive(Clone, Deserialize, TS)]
pub struct CreateSiteConfig {
    pub name: String,
    pub url: String,
    pub platform: Option<String>,
    pub username: Option<String>,
    pub app_password: Option<String>,
}

impl SiteConfig {
    pub async fn create(pool: &SqlitePool, data: CreateSiteConfig) -> Result<Self, sqlx::Error> {
        let id = Uuid::new_v4();
        sqlx::query_as::<_, SiteConfig>(
            r#"
            INSERT INTO workflow_sites (id, name, url, platform, username, app_password)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.name)
        .bind(data.url)
        .bind(data.platform)
        .bind(data.username)
        .bind(data.app_password)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, SiteConfig>(r#"SELECT * FROM workflow_sites WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_utils::{create_test_site, setup_test_pool};

    #[tokio::test]
    async fn test_password_never_leaves_the_struct() {
        let pool = setup_test_pool().await;
        let site = create_test_site(&pool).await;

        let loaded = SiteConfig::find_by_id(&pool, site.id).await.unwrap().unwrap();
        assert_eq!(loaded.app_password.as_deref(), Some("s3cret"));
        assert_eq!(loaded.username.as_deref(), Some("editor"));

        let json = serde_json::to_string(&loaded).unwrap();
        assert!(!json.contains("s3cret"));
        assert!(!format!("{loaded:?}").contains("s3cret"));
    }
}
