//! Environment-driven settings for the orchestrator and model gateway.

use std::time::Duration;

use super::{
    context::{ContextLimits, CredentialPolicy, DEFAULT_CREDENTIAL_KEYWORD, DEFAULT_MAX_PRIOR_OUTPUT_CHARS},
    invoker::DEFAULT_GATEWAY_TIMEOUT_SECS,
};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4";
pub const DEFAULT_OUTPUT_PREVIEW_CHARS: usize = 500;
pub const DEFAULT_GATEWAY_URL: &str = "http://127.0.0.1:8787";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Used when neither the phase nor the template names a model.
    pub default_model: String,
    pub context_limits: ContextLimits,
    pub credential_policy: CredentialPolicy,
    pub output_preview_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            context_limits: ContextLimits::default(),
            credential_policy: CredentialPolicy::default(),
            output_preview_chars: DEFAULT_OUTPUT_PREVIEW_CHARS,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default_model = lookup("WORKFLOW_DEFAULT_MODEL")
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let max_prior_output_chars = parse_or(
            lookup("WORKFLOW_MAX_PRIOR_OUTPUT_CHARS"),
            DEFAULT_MAX_PRIOR_OUTPUT_CHARS,
        );
        let output_preview_chars = parse_or(
            lookup("WORKFLOW_OUTPUT_PREVIEW_CHARS"),
            DEFAULT_OUTPUT_PREVIEW_CHARS,
        );

        let keywords = lookup("WORKFLOW_CREDENTIAL_KEYWORDS")
            .unwrap_or_else(|| DEFAULT_CREDENTIAL_KEYWORD.to_string());
        let credential_policy = CredentialPolicy::new(keywords.split(','));

        Self {
            default_model,
            context_limits: ContextLimits {
                max_prior_output_chars,
            },
            credential_policy,
            output_preview_chars,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            base_url: lookup("MODEL_GATEWAY_URL").unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string()),
            api_key: lookup("MODEL_GATEWAY_API_KEY").filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(parse_or(
                lookup("MODEL_GATEWAY_TIMEOUT_SECS"),
                DEFAULT_GATEWAY_TIMEOUT_SECS,
            )),
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}
