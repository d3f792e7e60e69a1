//! Structured artifacts embedded in model output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Opening fence tagged `json`, the enclosed body, then the closing fence.
static JSON_FENCE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?si)```json[ \t]*\r?\n(.*?)```").expect("valid json fence regex")
});

/// Parse the first ```json fenced block in `output`.
///
/// Only a JSON object counts as an artifact. A missing block, invalid JSON
/// or a non-object value all yield `None`; none of these are errors.
pub fn extract(output: &str) -> Option<Map<String, Value>> {
    let captures = JSON_FENCE_REGEX.captures(output)?;
    let body = captures.get(1)?.as_str().trim();

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("[WORKFLOW_ARTIFACTS] Ignoring malformed artifact block: {}", e);
            None
        }
    }
}
