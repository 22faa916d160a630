//! Configuration file handling.
//!
//! This module handles loading, validating and merging configuration from
//! `.analystflow.toml` files.

use crate::error::PipelineError;
use crate::models::AgentRole;
use crate::report::ReportFormat;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = ".analystflow.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Model endpoint settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Blocking worker pool settings.
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Stream bridge settings.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Per-caller rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Request batching.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Analysis pipeline roles.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Standalone agents available for single-agent chat.
    #[serde(default = "default_agents")]
    pub agents: BTreeMap<String, RoleSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            model: ModelConfig::default(),
            workers: WorkerConfig::default(),
            stream: StreamConfig::default(),
            rate_limit: RateLimitConfig::default(),
            batch: BatchConfig::default(),
            pipeline: PipelineConfig::default(),
            agents: default_agents(),
        }
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default report output path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Default report format.
    #[serde(default)]
    pub format: ReportFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
            format: ReportFormat::default(),
        }
    }
}

fn default_output() -> String {
    "analysis_report.md".to_string()
}

/// LLM endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Default model name.
    #[serde(default = "default_model")]
    pub name: String,

    /// Ollama API URL.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Deadline for a single agent call, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Maximum tokens to generate per call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Publish partial output while a call is still running.
    #[serde(default)]
    pub stream_partials: bool,

    /// Process-wide default credential. Per-run credentials override it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            ollama_url: default_ollama_url(),
            timeout_seconds: default_timeout(),
            max_tokens: None,
            stream_partials: false,
            api_key: None,
        }
    }
}

impl ModelConfig {
    pub fn call_deadline(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_timeout() -> u64 {
    300
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum number of concurrent blocking agent calls.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

fn default_max_workers() -> usize {
    10
}

/// Stream bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Sleep between checks of the partial-output channel.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl StreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_interval() -> u64 {
    100
}

/// Sliding-window rate limit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per caller within the window.
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,

    /// Window length in seconds.
    #[serde(default = "default_window")]
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_seconds: default_window(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

fn default_max_requests() -> usize {
    5
}

fn default_window() -> u64 {
    60
}

/// Request batching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Number of pending requests that triggers a dispatch.
    #[serde(default = "default_batch_size")]
    pub size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

/// One configured agent role.
///
/// A role either carries complete `instructions`, or a `focus` line that is
/// appended to the pipeline's base instructions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instructions: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub focus: String,

    /// Prompt lead-in for specialist roles, e.g. "Analyze current processes".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task: String,

    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl RoleSpec {
    fn focused(name: &str, focus: &str, task: &str, temperature: f32) -> Self {
        Self {
            name: name.to_string(),
            instructions: String::new(),
            focus: focus.to_string(),
            task: task.to_string(),
            temperature,
            model: None,
        }
    }

    fn standalone(name: &str, instructions: &str, temperature: f32) -> Self {
        Self {
            name: name.to_string(),
            instructions: instructions.to_string(),
            focus: String::new(),
            task: String::new(),
            temperature,
            model: None,
        }
    }

    /// Builds the agent role, combining base instructions with the focus line.
    pub fn to_role(&self, base_instructions: &str) -> AgentRole {
        let instructions = if !self.instructions.trim().is_empty() {
            self.instructions.clone()
        } else if self.focus.trim().is_empty() {
            base_instructions.to_string()
        } else {
            format!("{}\n{}", base_instructions, self.focus)
        };

        AgentRole::new(self.name.clone(), instructions, self.temperature)
            .with_model(self.model.clone())
    }

    fn validate(&self, context: &str) -> Result<(), PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Configuration(format!(
                "{} role has an empty name",
                context
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(PipelineError::Configuration(format!(
                "role '{}' temperature {} is outside 0.0..=2.0",
                self.name, self.temperature
            )));
        }
        Ok(())
    }
}

/// Analysis pipeline roles and request layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Base instructions shared by the specialist and synthesis roles.
    #[serde(default = "default_instructions")]
    pub instructions: String,

    /// Request field naming the subject, part of the memory key.
    #[serde(default = "default_name_field")]
    pub name_field: String,

    /// Request field naming the subject's category, part of the memory key.
    #[serde(default = "default_category_field")]
    pub category_field: String,

    /// Request field handed to every specialist.
    #[serde(default = "default_subject_field")]
    pub subject_field: String,

    /// Fan-out roles, in declaration order.
    #[serde(default = "default_specialists")]
    pub specialists: Vec<RoleSpec>,

    #[serde(default = "default_reflection")]
    pub reflection: RoleSpec,

    #[serde(default = "default_synthesis")]
    pub synthesis: RoleSpec,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            instructions: default_instructions(),
            name_field: default_name_field(),
            category_field: default_category_field(),
            subject_field: default_subject_field(),
            specialists: default_specialists(),
            reflection: default_reflection(),
            synthesis: default_synthesis(),
        }
    }
}

impl PipelineConfig {
    /// Checks that every role is usable. Runs before any stage is dispatched.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.specialists.is_empty() {
            return Err(PipelineError::Configuration(
                "pipeline needs at least one specialist role".to_string(),
            ));
        }

        let needs_base = self
            .specialists
            .iter()
            .chain(std::iter::once(&self.synthesis))
            .any(|r| r.instructions.trim().is_empty());
        if needs_base && self.instructions.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "pipeline base instructions are empty".to_string(),
            ));
        }
        if self.reflection.instructions.trim().is_empty() {
            return Err(PipelineError::Configuration(format!(
                "reflection role '{}' has no instructions",
                self.reflection.name
            )));
        }

        for field in [&self.name_field, &self.category_field, &self.subject_field] {
            if field.trim().is_empty() {
                return Err(PipelineError::Configuration(
                    "request field names must not be empty".to_string(),
                ));
            }
        }

        for spec in &self.specialists {
            spec.validate("specialist")?;
        }
        self.reflection.validate("reflection")?;
        self.synthesis.validate("synthesis")?;

        let mut names: Vec<&str> = self.specialists.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(PipelineError::Configuration(
                "specialist role names must be unique".to_string(),
            ));
        }

        Ok(())
    }

    pub fn specialist_roles(&self) -> Vec<AgentRole> {
        self.specialists
            .iter()
            .map(|s| s.to_role(&self.instructions))
            .collect()
    }

    pub fn reflection_role(&self) -> AgentRole {
        self.reflection.to_role(&self.instructions)
    }

    pub fn synthesis_role(&self) -> AgentRole {
        self.synthesis.to_role(&self.instructions)
    }
}

fn default_instructions() -> String {
    "You are a Digital Transformation Business Process Analyst. You examine how a business \
     operates today, assess its digital maturity, and identify practical improvements."
        .to_string()
}

fn default_name_field() -> String {
    "name".to_string()
}

fn default_category_field() -> String {
    "industry".to_string()
}

fn default_subject_field() -> String {
    "current_processes".to_string()
}

fn default_specialists() -> Vec<RoleSpec> {
    vec![
        RoleSpec::focused(
            "process-analysis",
            "Focus on process analysis and workflow optimization.",
            "Analyze current processes",
            0.3,
        ),
        RoleSpec::focused(
            "gap-assessment",
            "Focus on identifying gaps and maturity assessment.",
            "Assess gaps and maturity",
            0.3,
        ),
        RoleSpec::focused(
            "opportunity-finding",
            "Focus on identifying opportunities and innovation potential.",
            "Identify opportunities",
            0.7,
        ),
    ]
}

fn default_reflection() -> RoleSpec {
    RoleSpec::standalone(
        "reflection",
        "You are a critical thinking expert focused on validation and reflection.",
        0.4,
    )
}

fn default_synthesis() -> RoleSpec {
    RoleSpec::focused(
        "recommendation",
        "Focus on making actionable recommendations.",
        "",
        0.4,
    )
}

fn default_agents() -> BTreeMap<String, RoleSpec> {
    [
        (
            "architect",
            "You are a Solution Architect. Turn business requirements into a technical \
             solution design covering components, integrations and data flows.",
            0.4,
        ),
        (
            "designer",
            "You are a UX and Process Designer. Turn a solution design into concrete \
             user journeys, screens and process maps.",
            0.6,
        ),
        (
            "automator",
            "You are an Automation Engineer. Identify which steps of a design can be \
             automated and describe the automation workflows.",
            0.3,
        ),
        (
            "trainer",
            "You are a Change Management and Training Lead. Plan how staff adopt the new \
             processes and tools.",
            0.5,
        ),
        (
            "measurer",
            "You are a Performance Analyst. Define KPIs and evaluate the impact of the \
             transformation against them.",
            0.2,
        ),
    ]
    .into_iter()
    .map(|(name, instructions, temperature)| {
        (
            name.to_string(),
            RoleSpec::standalone(name, instructions, temperature),
        )
    })
    .collect()
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE_NAME);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Checks limits and roles. Any failure is a configuration error.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.workers.max_workers == 0 {
            return Err(PipelineError::Configuration(
                "workers.max_workers must be at least 1".to_string(),
            ));
        }
        if self.batch.size == 0 {
            return Err(PipelineError::Configuration(
                "batch.size must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_seconds == 0 {
            return Err(PipelineError::Configuration(
                "rate_limit.max_requests and rate_limit.window_seconds must be at least 1"
                    .to_string(),
            ));
        }
        if self.model.timeout_seconds == 0 {
            return Err(PipelineError::Configuration(
                "model.timeout_seconds must be at least 1".to_string(),
            ));
        }
        if self.stream.poll_interval_ms == 0 {
            return Err(PipelineError::Configuration(
                "stream.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        for (name, spec) in &self.agents {
            spec.validate(name)?;
        }
        self.pipeline.validate()
    }

    /// Looks up a standalone agent by name.
    pub fn agent_role(&self, name: &str) -> Option<AgentRole> {
        self.agents
            .get(name)
            .map(|spec| spec.to_role(&self.pipeline.instructions))
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only when
    /// they were explicitly provided.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if let Some(ref url) = args.ollama_url {
            self.model.ollama_url = url.clone();
        }
        if let Some(timeout) = args.timeout {
            self.model.timeout_seconds = timeout;
        }
        if let Some(ref key) = args.api_key {
            self.model.api_key = Some(key.clone());
        }
        if args.stream_partials {
            self.model.stream_partials = true;
        }
        if let Some(workers) = args.workers {
            self.workers.max_workers = workers;
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
