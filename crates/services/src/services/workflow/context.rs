//! Builds the user message sent to the model for one phase.
//!
//! Sections appear in a fixed order, each only when it has content:
//! input data, site, prior phase outputs (template order), artifacts.

use db::models::{
    site_config::SiteConfig,
    workflow_run::{Artifacts, PhaseResults},
    workflow_template::PhaseDefinition,
};
use serde_json::Value;
use utils::text::truncate_chars;

pub const DEFAULT_MAX_PRIOR_OUTPUT_CHARS: usize = 4000;
pub const DEFAULT_CREDENTIAL_KEYWORD: &str = "publish";

const SECTION_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    /// Each prior phase's output is cut to this many characters.
    pub max_prior_output_chars: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_prior_output_chars: DEFAULT_MAX_PRIOR_OUTPUT_CHARS,
        }
    }
}

/// Decides which phases may see site credentials.
///
/// A phase qualifies when its name or skill reference contains one of the
/// keywords, compared case-insensitively. No keywords means no phase does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPolicy {
    keywords: Vec<String>,
}

impl CredentialPolicy {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn allows_credentials(&self, phase: &PhaseDefinition) -> bool {
        let name = phase.name.to_lowercase();
        let skill_ref = phase.skill_ref.as_deref().unwrap_or_default().to_lowercase();
        self.keywords
            .iter()
            .any(|k| name.contains(k.as_str()) || skill_ref.contains(k.as_str()))
    }
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self::new([DEFAULT_CREDENTIAL_KEYWORD])
    }
}

/// Everything the builder reads for one phase. Nothing here is mutated.
#[derive(Debug, Clone, Copy)]
pub struct PhaseContext<'a> {
    pub input_data: &'a Value,
    pub site: Option<&'a SiteConfig>,
    pub phase_results: &'a PhaseResults,
    pub artifacts: &'a Artifacts,
    pub phase: &'a PhaseDefinition,
    /// The template's phases, used to order prior outputs.
    pub phase_order: &'a [PhaseDefinition],
}

#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    limits: ContextLimits,
    credentials: CredentialPolicy,
}

impl ContextBuilder {
    pub fn new(limits: ContextLimits, credentials: CredentialPolicy) -> Self {
        Self {
            limits,
            credentials,
        }
    }

    pub fn credential_policy(&self) -> &CredentialPolicy {
        &self.credentials
    }

    pub fn build(&self, ctx: PhaseContext<'_>) -> String {
        let mut sections: Vec<String> = Vec::new();

        if !is_empty_value(ctx.input_data) {
            sections.push(format!("## Input\n{}", to_pretty_json(ctx.input_data)));
        }

        if let Some(site) = ctx.site {
            sections.push(self.site_section(site, ctx.phase));
        }

        for phase in ctx.phase_order {
            if phase.name == ctx.phase.name {
                continue;
            }
            let Some(output) = ctx
                .phase_results
                .get(&phase.name)
                .and_then(|result| result.output())
                .filter(|output| !output.trim().is_empty())
            else {
                continue;
            };
            sections.push(format!(
                "## Output from phase: {}\n{}",
                phase.name,
                truncate_chars(output, self.limits.max_prior_output_chars)
            ));
        }

        if !ctx.artifacts.is_empty() {
            sections.push(format!(
                "## Artifacts\n{}",
                to_pretty_json(&Value::Object(ctx.artifacts.as_map().clone()))
            ));
        }

        sections.join(SECTION_SEPARATOR)
    }

    fn site_section(&self, site: &SiteConfig, phase: &PhaseDefinition) -> String {
        let mut lines = vec![
            "## Site".to_string(),
            format!("Name: {}", site.name),
            format!("URL: {}", site.url),
        ];
        if let Some(platform) = &site.platform {
            lines.push(format!("Platform: {platform}"));
        }

        if self.credentials.allows_credentials(phase) {
            if let Some(username) = &site.username {
                lines.push(format!("Username: {username}"));
            }
            if let Some(password) = &site.app_password {
                lines.push(format!("Application password: {password}"));
            }
        }

        lines.join("\n")
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
