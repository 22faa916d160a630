//! Prompt templates for the pipeline stages.

use crate::error::PipelineError;

/// Longest accepted free-text message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 1000;

const FORBIDDEN_CHARS: &[char] = &['<', '>', '{', '}', '[', ']', '\\', '`'];
const FORBIDDEN_SCHEMES: &[&str] = &["javascript:", "vbscript:", "data:"];

/// Prompt for one fan-out role: its task line followed by the subject.
pub fn specialist_prompt(task: &str, subject: &str) -> String {
    if task.trim().is_empty() {
        subject.to_string()
    } else {
        format!("{}:\n{}", task, subject)
    }
}

pub fn reflection_prompt(analysis: &str, context: &str) -> String {
    format!(
        "Review and reflect on the following analysis:\n\n\
         Analysis:\n{}\n\n\
         Business Context:\n{}\n\n\
         Consider:\n\
         1. Are the assumptions valid?\n\
         2. Is the analysis comprehensive?\n\
         3. Are there alternative perspectives?\n\
         4. What potential biases exist?\n\
         5. How reliable are the recommendations?\n\n\
         Provide reflection notes and any necessary adjustments.",
        analysis, context
    )
}

pub fn synthesis_prompt(analysis: &str, reflection: &str, context: &str) -> String {
    format!(
        "Create final recommendations based on:\n\n\
         Initial Analysis:\n{}\n\n\
         Self-Reflection:\n{}\n\n\
         Business Context:\n{}",
        analysis, reflection, context
    )
}

/// Checks a free-text message before it is sent to an agent.
///
/// Rejects blank and overlong messages and anything carrying markup or
/// script schemes. Returns the trimmed message.
pub fn validate_message(message: &str) -> Result<&str, PipelineError> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::InvalidRequest(
            "message is empty".to_string(),
        ));
    }

    let chars = message.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(PipelineError::InvalidRequest(format!(
            "message has {} characters, the limit is {}",
            chars, MAX_MESSAGE_CHARS
        )));
    }

    if let Some(c) = message.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(PipelineError::InvalidRequest(format!(
            "message contains forbidden character '{}'",
            c
        )));
    }

    let lowered = message.to_lowercase();
    if let Some(scheme) = FORBIDDEN_SCHEMES.iter().find(|s| lowered.contains(*s)) {
        return Err(PipelineError::InvalidRequest(format!(
            "message contains forbidden scheme '{}'",
            scheme
        )));
    }

    Ok(trimmed)
}
