//! Validation for content arriving on `task:submit` before it is persisted
//! or handed to an agent. The chat-platform and prompt-template layers are
//! external collaborators; this module only guards the boundary where their
//! output enters the fabric as a `TaskSubmit` envelope payload.

use crate::MeshError;
use html_escape::encode_text;
use regex::Regex;
use std::collections::HashSet;

/// DoS guard: caps the prompt a chat message can carry into a task.
pub const MAX_PROMPT_LENGTH: usize = 10_000;

pub const MAX_BOT_NAME_LENGTH: usize = 100;

static SAFE_PROMPT_REGEX: &str =
    r"^[a-zA-Z0-9\s\.,!?:;()\[\]{}\-_+=@#$%^&*|\\/<>'`~\n\r\t]+$";

static DANGEROUS_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "data:text/html",
    "vbscript:",
    "&&",
    "||",
    ";rm",
    ";del",
    "`rm",
    "`del",
    "$(rm",
    "$(del",
    "';",
    "\";",
    "union select",
    "drop table",
    "delete from",
    "../",
    "..\\",
    "file://",
    "/etc/passwd",
    "/etc/shadow",
    "C:\\Windows\\System32",
];

#[derive(Debug, Clone)]
pub struct TaskContentValidator {
    safe_content_regex: Regex,
    dangerous_patterns: HashSet<String>,
}

impl TaskContentValidator {
    pub fn new() -> Result<Self, MeshError> {
        let safe_content_regex = Regex::new(SAFE_PROMPT_REGEX)
            .map_err(|e| MeshError::internal(format!("invalid validation regex: {e}")))?;
        let dangerous_patterns = DANGEROUS_PATTERNS
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        Ok(Self {
            safe_content_regex,
            dangerous_patterns,
        })
    }

    /// Validate and HTML-escape a task prompt before it is stored or sent to
    /// an agent. Rejects rather than strips, so a caller always knows
    /// whether the content it is about to forward is safe.
    pub fn validate_prompt(&self, prompt: &str) -> Result<String, MeshError> {
        if prompt.len() > MAX_PROMPT_LENGTH {
            return Err(MeshError::Validation(format!(
                "prompt exceeds maximum length of {MAX_PROMPT_LENGTH} characters"
            )));
        }
        if prompt.trim().is_empty() {
            return Err(MeshError::Validation("prompt cannot be empty".into()));
        }

        let lowered = prompt.to_lowercase();
        for pattern in &self.dangerous_patterns {
            if lowered.contains(pattern.as_str()) {
                return Err(MeshError::Validation(
                    "prompt contains a disallowed pattern".into(),
                ));
            }
        }

        if !self.safe_content_regex.is_match(prompt) {
            return Err(MeshError::Validation(
                "prompt contains invalid characters".into(),
            ));
        }

        Ok(encode_text(prompt).to_string())
    }

    pub fn validate_bot_name(&self, name: &str) -> Result<(), MeshError> {
        if name.is_empty() || name.len() > MAX_BOT_NAME_LENGTH {
            return Err(MeshError::Validation(format!(
                "bot name must be non-empty and under {MAX_BOT_NAME_LENGTH} characters"
            )));
        }
        if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            return Err(MeshError::Validation(
                "bot name can only contain alphanumerics, underscores, and hyphens".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TaskContentValidator {
    fn default() -> Self {
        Self::new().expect("built-in validation regex is always valid")
    }
}
