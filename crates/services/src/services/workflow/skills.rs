use async_trait::async_trait;
use db::{DBService, models::skill::Skill};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkillError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Skill store unavailable: {0}")]
    Unavailable(String),
}

/// What a phase needs from its skill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSkill {
    pub system_prompt: String,
    pub token_budget_hint: Option<u32>,
}

/// Resolves a phase's symbolic skill reference. `Ok(None)` means the skill
/// does not exist, which the orchestrator treats as a skip.
#[async_trait]
pub trait SkillLoader: Send + Sync {
    async fn resolve(&self, skill_ref: &str) -> Result<Option<ResolvedSkill>, SkillError>;
}

#[derive(Clone)]
pub struct DbSkillLoader {
    db: DBService,
}

impl DbSkillLoader {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SkillLoader for DbSkillLoader {
    async fn resolve(&self, skill_ref: &str) -> Result<Option<ResolvedSkill>, SkillError> {
        let skill = Skill::find_by_ref(&self.db.pool, skill_ref).await?;
        Ok(skill.map(|s| ResolvedSkill {
            system_prompt: s.system_prompt,
            token_budget_hint: s
                .token_budget_hint
                .and_then(|hint| u32::try_from(hint).ok())
                .filter(|hint| *hint > 0),
        }))
    }
}
