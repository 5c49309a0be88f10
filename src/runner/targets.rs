//! Target resolution: which browser sessions a run needs.

use indexmap::IndexMap;

use super::RunError;
use crate::model::{BrowserTarget, RunConfig};

/// Id of the implicit target synthesized from a bare URL.
pub const MAIN_TARGET: &str = "main";

/// The ordered target set for a run: `browserConfig` when present, else a
/// single `main` target built from `url`/`username`/`password`.
pub fn resolve(config: &RunConfig) -> Result<IndexMap<String, BrowserTarget>, RunError> {
    if !config.browser_config.is_empty() {
        return Ok(config.browser_config.clone());
    }
    match config.url.as_deref() {
        Some(url) if !url.is_empty() => {
            let mut targets = IndexMap::new();
            targets.insert(
                MAIN_TARGET.to_string(),
                BrowserTarget {
                    url: Some(url.to_string()),
                    username: config.username.clone(),
                    password: config.password.clone(),
                },
            );
            Ok(targets)
        }
        _ => Err(RunError::MissingTarget),
    }
}

/// Human-facing name used in log lines and screenshot labels.
pub fn display_name(id: &str) -> String {
    if id == MAIN_TARGET {
        "Browser".to_string()
    } else {
        id.replace("browser_", "Browser ").to_uppercase()
    }
}

/// Step instruction with the target's credentials appended as a hint.
pub fn step_instruction(action: &str, target: &BrowserTarget) -> String {
    if !target.has_credentials() {
        return action.to_string();
    }
    format!(
        "{}\n(Credentials: {} / {})",
        action,
        target.username.as_deref().unwrap_or_default(),
        target.password.as_deref().unwrap_or_default()
    )
}

/// Prompt with the target's credentials appended as a hint.
pub fn prompt_instruction(prompt: &str, target: &BrowserTarget) -> String {
    if !target.has_credentials() {
        return prompt.to_string();
    }
    format!(
        "{}\n\nCredentials if needed:\nUsername: {}\nPassword: {}",
        prompt,
        target.username.as_deref().unwrap_or_default(),
        target.password.as_deref().unwrap_or_default()
    )
}
