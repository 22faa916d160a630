//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::config::GeneralConfig;
use crate::models::PipelineRequest;
use crate::report::ReportFormat;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// AnalystFlow - multi-agent business analysis with local AI
///
/// Runs several specialist agents in parallel over a business description,
/// reflects on their findings and synthesizes final recommendations.
///
/// Examples:
///   analystflow analyze --name Acme --industry Retail --current-processes "Manual invoicing"
///   analystflow analyze --input acme.json --format json --output acme.json
///   analystflow analyze --input acme.json --stream
///   analystflow chat --agent designer "Sketch an onboarding journey"
///   analystflow batch --input requests.jsonl
///   analystflow init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .analystflow.toml in the current directory
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Ollama API endpoint URL
    #[arg(long, global = true, env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    /// Default Ollama model for every role without its own model
    #[arg(short, long, global = true, env = "ANALYSTFLOW_MODEL")]
    pub model: Option<String>,

    /// Credential sent with every agent call
    #[arg(long, global = true, env = "ANALYSTFLOW_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Caller identity used for rate limiting
    #[arg(long, global = true, default_value = "local", value_name = "ID")]
    pub caller: String,

    /// Deadline for a single agent call, in seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Maximum number of agent calls running at once
    #[arg(long, global = true, value_name = "NUM")]
    pub workers: Option<usize>,

    /// Ask the model for incremental output and stream it as it arrives
    #[arg(long, global = true)]
    pub stream_partials: bool,

    /// Dry run: use scripted agents instead of calling the model
    #[arg(long, global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the full analysis pipeline for one business
    Analyze(AnalyzeArgs),

    /// Send one message to a standalone agent and stream the reply
    Chat {
        /// Agent name from the [agents] config section
        #[arg(short, long)]
        agent: String,

        /// Message for the agent
        message: String,
    },

    /// Run the pipeline for every request in a JSON Lines file
    ///
    /// Each line is an object: {"caller": "...", "request": {...}, "api_key": "..."}.
    /// Only "request" is required.
    Batch {
        /// Input file, one request per line
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Output file for the batch summary
        #[arg(short, long, default_value = "batch_report.md", value_name = "FILE")]
        output: PathBuf,
    },

    /// Generate a default .analystflow.toml configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Business description and output options for `analyze`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct AnalyzeArgs {
    /// JSON file holding the request as a flat object of strings
    ///
    /// Fields given as flags override fields from the file.
    #[arg(short, long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Business name
    #[arg(long)]
    pub name: Option<String>,

    /// Industry the business operates in
    #[arg(long)]
    pub industry: Option<String>,

    /// Company size
    #[arg(long)]
    pub size: Option<String>,

    /// Description of the current processes
    #[arg(long)]
    pub current_processes: Option<String>,

    /// Known pain points
    #[arg(long)]
    pub pain_points: Option<String>,

    /// Transformation goals
    #[arg(long)]
    pub goals: Option<String>,

    /// Additional request field (repeatable)
    #[arg(long = "field", value_name = "KEY=VALUE", value_parser = parse_field)]
    pub fields: Vec<(String, String)>,

    /// Stream the final recommendations to stdout instead of writing a report
    #[arg(long)]
    pub stream: bool,

    /// Output file path for the report
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<ReportFormat>,
}

fn parse_field(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

impl AnalyzeArgs {
    /// Build the pipeline request from the input file and flags.
    pub fn request(&self) -> Result<PipelineRequest> {
        let mut fields: BTreeMap<String, String> = match self.input {
            Some(ref path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read input file: {}", path.display()))?;
                let request: PipelineRequest = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse input file: {}", path.display()))?;
                request.fields().clone()
            }
            None => BTreeMap::new(),
        };

        let flags = [
            ("name", &self.name),
            ("industry", &self.industry),
            ("size", &self.size),
            ("current_processes", &self.current_processes),
            ("pain_points", &self.pain_points),
            ("goals", &self.goals),
        ];
        for (key, value) in flags {
            if let Some(value) = value {
                fields.insert(key.to_string(), value.clone());
            }
        }
        for (key, value) in &self.fields {
            fields.insert(key.clone(), value.clone());
        }

        Ok(fields.into_iter().collect())
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Command::InitConfig { .. } = self.command {
            return Ok(());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if !self.dry_run {
            if let Some(ref url) = self.ollama_url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
                }
            }
        }

        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }
        if self.workers == Some(0) {
            return Err("Workers must be at least 1".to_string());
        }
        if self.caller.trim().is_empty() {
            return Err("Caller must not be empty".to_string());
        }

        match self.command {
            Command::Analyze(ref analyze) => {
                if let Some(ref input) = analyze.input {
                    if !input.is_file() {
                        return Err(format!("Input file does not exist: {}", input.display()));
                    }
                }
                if analyze.stream && (analyze.output.is_some() || analyze.format.is_some()) {
                    return Err("--stream does not write a report; drop --output/--format".to_string());
                }
            }
            Command::Batch { ref input, .. } => {
                if !input.is_file() {
                    return Err(format!("Input file does not exist: {}", input.display()));
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    /// Log level once the config file is known. `--quiet` wins over
    /// `general.verbose`.
    pub fn log_level_for(&self, general: &GeneralConfig) -> tracing::Level {
        if !self.quiet && general.verbose {
            tracing::Level::DEBUG
        } else {
            self.log_level()
        }
    }
}
