//! Data models for the analysis pipeline.
//!
//! This module contains the core data structures shared by the orchestrator,
//! the memory store and the report generator: agent roles, requests, stage
//! results and pipeline runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Prefix of the content returned by a failed run.
pub const RUN_ERROR_PREFIX: &str = "Error performing analysis: ";

/// A named agent specialization bound to one invoker.
#[derive(Clone, Serialize, Deserialize)]
pub struct AgentRole {
    /// Role name, e.g. `process-analysis`.
    pub name: String,
    /// System instructions sent with every prompt.
    pub instructions: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Model override; the invoker default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Credential for the model endpoint.
    #[serde(skip)]
    pub credential: Option<String>,
}

impl AgentRole {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>, temperature: f32) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            temperature,
            model: None,
            credential: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Returns a copy of this role bound to the given credential.
    pub fn with_credential(&self, credential: &str) -> Self {
        Self {
            credential: Some(credential.to_string()),
            ..self.clone()
        }
    }
}

// Credentials never reach log output.
impl fmt::Debug for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRole")
            .field("name", &self.name)
            .field("temperature", &self.temperature)
            .field("model", &self.model)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Caller-supplied key/value context for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineRequest {
    fields: BTreeMap<String, String>,
}

impl PipelineRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Returns the trimmed value of a field, or `None` when absent or blank.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Renders the context as `key: value` lines in key order.
    pub fn render_context(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PipelineRequest {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// The pipeline stage that produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Specialist,
    Reflection,
    Synthesis,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Specialist => write!(f, "Specialist"),
            StageKind::Reflection => write!(f, "Reflection"),
            StageKind::Synthesis => write!(f, "Synthesis"),
        }
    }
}

/// Text output of one agent call within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub role: String,
    pub stage: StageKind,
    /// Position within the run, starting at 1.
    pub sequence: u32,
    pub content: String,
    pub completed_at: DateTime<Utc>,
}

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    FanningOut,
    Reflecting,
    Synthesizing,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_advance_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Created, FanningOut)
            | (FanningOut, Reflecting)
            | (Reflecting, Synthesizing)
            | (Synthesizing, Succeeded) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            RunState::Succeeded => "✅",
            RunState::Failed => "❌",
            _ => "⏳",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Created => write!(f, "Created"),
            RunState::FanningOut => write!(f, "Fanning out"),
            RunState::Reflecting => write!(f, "Reflecting"),
            RunState::Synthesizing => write!(f, "Synthesizing"),
            RunState::Succeeded => write!(f, "Succeeded"),
            RunState::Failed => write!(f, "Failed"),
        }
    }
}

/// One execution of the orchestration protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub request: PipelineRequest,
    /// Fan-out results in role-declaration order.
    pub fan_out: Vec<StageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflection: Option<StageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result: Option<StageResult>,
    pub state: RunState,
    /// Every state the run has entered, in order.
    pub history: Vec<RunState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(request: PipelineRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            fan_out: Vec::new(),
            reflection: None,
            final_result: None,
            state: RunState::Created,
            history: vec![RunState::Created],
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Moves the run to `next`. Illegal transitions are ignored and reported.
    pub fn advance(&mut self, next: RunState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        self.state = next;
        self.history.push(next);
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    /// Marks the run failed with the given reason.
    pub fn fail(&mut self, reason: impl ToString) {
        if self.advance(RunState::Failed) {
            self.error = Some(reason.to_string());
        }
    }

    pub fn reached(&self, state: RunState) -> bool {
        self.history.contains(&state)
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    /// The text handed back to callers: the final result, or the error text.
    pub fn content(&self) -> String {
        match (&self.final_result, &self.error) {
            (Some(result), _) if self.succeeded() => result.content.clone(),
            (_, Some(error)) => format!("{}{}", RUN_ERROR_PREFIX, error),
            _ => format!("{}run ended in state {}", RUN_ERROR_PREFIX, self.state),
        }
    }

    /// Number of stage results produced so far.
    pub fn stage_count(&self) -> usize {
        self.fan_out.len()
            + usize::from(self.reflection.is_some())
            + usize::from(self.final_result.is_some())
    }

    pub fn duration_seconds(&self) -> f64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Latest analysis stored for a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub result: StageResult,
    pub request: PipelineRequest,
    pub stored_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(content: &str) -> StageResult {
        StageResult {
            role: "recommendation".to_string(),
            stage: StageKind::Synthesis,
            sequence: 5,
            content: content.to_string(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_render_context_is_key_ordered() {
        let request = PipelineRequest::new()
            .with("name", "Acme")
            .with("industry", "Retail")
            .with("goals", "Automate invoicing");

        assert_eq!(
            request.render_context(),
            "goals: Automate invoicing\nindustry: Retail\nname: Acme"
        );
    }

    #[test]
    fn test_non_empty_trims_blank_fields() {
        let request = PipelineRequest::new().with("name", "   ").with("industry", " Retail ");
        assert_eq!(request.non_empty("name"), None);
        assert_eq!(request.non_empty("industry"), Some("Retail"));
        assert_eq!(request.non_empty("missing"), None);
    }

    #[test]
    fn test_state_transitions() {
        assert!(RunState::Created.can_advance_to(RunState::FanningOut));
        assert!(RunState::FanningOut.can_advance_to(RunState::Failed));
        assert!(!RunState::Created.can_advance_to(RunState::Reflecting));
        assert!(!RunState::Succeeded.can_advance_to(RunState::Failed));
        assert!(!RunState::Failed.can_advance_to(RunState::Failed));
    }

    #[test]
    fn test_run_is_immutable_once_terminal() {
        let mut run = PipelineRun::new(PipelineRequest::new());
        assert!(run.advance(RunState::FanningOut));
        run.fail("boom");
        assert_eq!(run.state, RunState::Failed);
        assert!(run.completed_at.is_some());

        run.fail("second failure");
        assert!(!run.advance(RunState::Reflecting));
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert_eq!(
            run.history,
            vec![RunState::Created, RunState::FanningOut, RunState::Failed]
        );
    }

    #[test]
    fn test_content_of_failed_run() {
        let mut run = PipelineRun::new(PipelineRequest::new());
        run.fail("Agent 'x' failed: timeout");
        assert_eq!(
            run.content(),
            "Error performing analysis: Agent 'x' failed: timeout"
        );
    }

    #[test]
    fn test_content_of_successful_run() {
        let mut run = PipelineRun::new(PipelineRequest::new());
        for state in [
            RunState::FanningOut,
            RunState::Reflecting,
            RunState::Synthesizing,
        ] {
            assert!(run.advance(state));
        }
        run.final_result = Some(stage("Ship it"));
        assert!(run.advance(RunState::Succeeded));
        assert_eq!(run.content(), "Ship it");
        assert_eq!(run.stage_count(), 1);
    }

    #[test]
    fn test_role_debug_redacts_credential() {
        let role = AgentRole::new("gap-assessment", "Assess gaps", 0.3).with_credential("sk-secret");
        let debug = format!("{:?}", role);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_request_deserializes_from_flat_object() {
        let request: PipelineRequest =
            serde_json::from_str(r#"{"name": "Acme", "industry": "Retail"}"#).unwrap();
        assert_eq!(request.get("name"), Some("Acme"));
        assert_eq!(request.fields().len(), 2);
    }
}
