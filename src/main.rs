//! AnalystFlow - multi-agent business analysis pipeline
//!
//! A CLI tool that fans a business description out to several specialist
//! agents on a local Ollama server, reflects on their findings and writes
//! the synthesized recommendations as a report.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (configuration, connection, I/O, etc.)
//!   2 - An analysis run failed or a request was rate limited

use analystflow::agent::{InvokerFactory, OllamaInvokerFactory, OllamaSettings, ScriptedFactory};
use analystflow::analysis::BatchSummary;
use analystflow::batch::{BatchItem, BatchProcessor};
use analystflow::cli::{AnalyzeArgs, Args, Command};
use analystflow::config::{Config, CONFIG_FILE_NAME};
use analystflow::limiter::RateLimiter;
use analystflow::models::{PipelineRequest, RUN_ERROR_PREFIX};
use analystflow::pipeline::PipelineOrchestrator;
use analystflow::report::{self, RunReport};
use analystflow::stream::{ChunkStream, STREAM_ERROR_PREFIX};
use anyhow::{Context, Result};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if let Command::InitConfig { force } = args.command {
        return handle_init_config(force);
    }

    // Load config first; general.verbose decides the log level
    let (mut config, source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    init_logging(args.log_level_for(&config.general));

    info!("AnalystFlow v{}", env!("CARGO_PKG_VERSION"));
    source.log();
    debug!("Command: {:?}", args.command);

    match run(args, config).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .analystflow.toml.
fn handle_init_config(force: bool) -> Result<()> {
    let path = Path::new(CONFIG_FILE_NAME);

    if path.exists() && !force {
        eprintln!(
            "⚠️  {} already exists. Remove it first, edit it manually or pass --force.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Edit it to customize the model, roles, limits and more.");
    Ok(())
}

/// Initialize logging at the given level.
fn init_logging(level: tracing::Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Everything a command needs, built once from configuration.
struct App {
    config: Config,
    orchestrator: PipelineOrchestrator,
    limiter: Arc<RateLimiter>,
    quiet: bool,
}

/// Dispatch the subcommand. Returns the exit code.
async fn run(args: Args, config: Config) -> Result<i32> {
    let factory: Arc<dyn InvokerFactory> = if args.dry_run {
        println!("🧪 Dry run: scripted agents, no model calls are made");
        Arc::new(ScriptedFactory::new())
    } else {
        Arc::new(OllamaInvokerFactory::new(OllamaSettings::from(&config.model))?)
    };

    let mut orchestrator = PipelineOrchestrator::from_config(&config, factory)?;
    if args.dry_run && config.model.api_key.is_none() {
        orchestrator = orchestrator.with_default_credential(Some("dry-run".to_string()));
    }

    let app = App {
        limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
        orchestrator,
        config,
        quiet: args.quiet,
    };

    match args.command {
        Command::Analyze(ref analyze) => run_analyze(&app, analyze, &args.caller).await,
        Command::Chat {
            ref agent,
            ref message,
        } => run_chat(&app, agent, message, &args.caller).await,
        Command::Batch {
            ref input,
            ref output,
        } => run_batch(&app, input, output, &args.caller).await,
        Command::InitConfig { .. } => Ok(0),
    }
}

fn rate_limited(app: &App, caller: &str) -> bool {
    if app.limiter.allow(caller) {
        return false;
    }
    warn!("Rate limit exceeded for caller '{}'", caller);
    eprintln!(
        "⛔ Rate limit exceeded for caller '{}': at most {} requests per {}s.",
        caller, app.config.rate_limit.max_requests, app.config.rate_limit.window_seconds
    );
    true
}

async fn run_analyze(app: &App, analyze: &AnalyzeArgs, caller: &str) -> Result<i32> {
    let request = analyze.request()?;
    if rate_limited(app, caller) {
        return Ok(2);
    }

    let subject = app
        .orchestrator
        .key_for(&request)
        .unwrap_or_else(|| "unnamed".to_string());
    let pipeline = app.orchestrator.pipeline();
    println!("🔬 Analyzing {}", subject);
    println!(
        "   Specialists: {}",
        pipeline
            .specialists
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("   Model: {}", app.config.model.name);

    if analyze.stream {
        println!();
        let stream = app.orchestrator.run_streaming(request, None)?;
        let last = print_stream(stream).await?;
        return Ok(if is_error_chunk(&last) { 2 } else { 0 });
    }

    let spinner = spinner(app.quiet, "Running fan-out, reflection and synthesis...");
    let run = app.orchestrator.run(request, None).await?;
    if let Some(pb) = spinner {
        pb.finish_with_message(format!("{} {}", run.state.emoji(), run.state));
    }

    let format = analyze.format.unwrap_or(app.config.general.format);
    let output = analyze
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&app.config.general.output));
    let succeeded = run.succeeded();
    let report = RunReport::new(run, subject, app.config.model.name.clone());

    let content = format.render(&report)?;
    std::fs::write(&output, &content)
        .with_context(|| format!("Failed to write report to {}", output.display()))?;

    println!("\n📊 Analysis Summary:");
    println!("   Stages completed: {}", report.metadata.stages_completed);
    println!("   Duration: {:.1}s", report.metadata.duration_seconds);

    if succeeded {
        println!("\n✅ Analysis complete! Report saved to: {}", output.display());
        Ok(0)
    } else {
        eprintln!("\n⛔ {}", report.run.content());
        eprintln!("   Partial report saved to: {}", output.display());
        Ok(2)
    }
}

async fn run_chat(app: &App, agent: &str, message: &str, caller: &str) -> Result<i32> {
    let role = app.config.agent_role(agent).with_context(|| {
        format!(
            "Unknown agent '{}'. Available: {}",
            agent,
            app.config.agents.keys().cloned().collect::<Vec<_>>().join(", ")
        )
    })?;
    if rate_limited(app, caller) {
        return Ok(2);
    }

    let stream = app.orchestrator.chat(&role, message, None)?;
    let last = print_stream(stream).await?;
    Ok(if is_error_chunk(&last) { 2 } else { 0 })
}

fn is_error_chunk(chunk: &str) -> bool {
    chunk.starts_with(STREAM_ERROR_PREFIX) || chunk.starts_with(RUN_ERROR_PREFIX)
}

/// Print partial chunks as they arrive. The final chunk repeats the full
/// text, so it is only printed when no partials came before it.
async fn print_stream(mut stream: ChunkStream) -> Result<String> {
    let mut stdout = std::io::stdout();
    let mut held: Option<String> = None;
    let mut partials = 0usize;

    while let Some(chunk) = stream.next().await {
        if let Some(previous) = held.replace(chunk) {
            partials += 1;
            write!(stdout, "{}", previous)?;
            stdout.flush()?;
        }
    }

    let last = held.unwrap_or_default();
    if partials == 0 || is_error_chunk(&last) {
        if partials > 0 {
            println!();
        }
        println!("{}", last);
    } else {
        println!();
    }
    Ok(last)
}

fn spinner(quiet: bool, message: &'static str) -> Option<ProgressBar> {
    if quiet {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(120));
    Some(pb)
}

/// One line of a batch input file.
#[derive(Debug, Deserialize)]
struct BatchEntry {
    #[serde(default)]
    caller: Option<String>,
    request: PipelineRequest,
    #[serde(default)]
    api_key: Option<String>,
}

async fn run_batch(app: &App, input: &Path, output: &Path, default_caller: &str) -> Result<i32> {
    let content = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read batch file: {}", input.display()))?;

    let summary = Arc::new(Mutex::new(BatchSummary::default()));
    let reports = Arc::new(Mutex::new(Vec::<RunReport>::new()));

    let processor = {
        let orchestrator = app.orchestrator.clone();
        let summary = summary.clone();
        let reports = reports.clone();
        let model = app.config.model.name.clone();

        BatchProcessor::from_config(&app.config.batch, move |item: BatchItem<BatchEntry>| {
            let orchestrator = orchestrator.clone();
            let summary = summary.clone();
            let reports = reports.clone();
            let model = model.clone();
            async move {
                let entry = item.request;
                let subject = orchestrator
                    .key_for(&entry.request)
                    .unwrap_or_else(|| format!("batch-{}-{}", item.batch, item.position));

                match orchestrator.run(entry.request, entry.api_key.as_deref()).await {
                    Ok(run) => {
                        info!("{} {}: {}", run.state.emoji(), subject, run.state);
                        summary.lock().add_run(&run);
                        reports.lock().push(RunReport::new(run, subject, model));
                    }
                    Err(e) => {
                        warn!("Request for {} rejected: {}", subject, e);
                        summary.lock().add_rejected();
                    }
                }
            }
        })
    };

    println!(
        "📦 Processing {} in batches of {}",
        input.display(),
        processor.batch_size()
    );

    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: BatchEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping line {}: {}", index + 1, e);
                summary.lock().add_rejected();
                continue;
            }
        };

        let caller = entry.caller.as_deref().unwrap_or(default_caller);
        if !app.limiter.allow(caller) {
            warn!("Line {}: rate limit exceeded for caller '{}'", index + 1, caller);
            summary.lock().add_rate_limited();
            continue;
        }
        processor.add(entry).await;
    }

    let drained = processor.flush().await;
    debug!("Flushed {} remaining requests", drained);

    let stats = processor.stats();
    let summary = summary.lock().clone();
    let reports = reports.lock().clone();

    let markdown = report::generate_batch_report(&summary, &reports);
    std::fs::write(output, &markdown)
        .with_context(|| format!("Failed to write batch report to {}", output.display()))?;

    println!("\n📊 Batch Summary:");
    println!("   Dispatches: {} ({} requests)", stats.batches, stats.requests);
    println!(
        "   ✅ Succeeded: {} | ❌ Failed: {} | ⛔ Rate limited: {} | Rejected: {}",
        summary.succeeded, summary.failed, summary.rate_limited, summary.rejected
    );
    println!("\n✅ Batch report saved to: {}", output.display());

    Ok(if summary.all_succeeded() { 0 } else { 2 })
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<(Config, ConfigSource)> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)?;
        return Ok((config, ConfigSource::Explicit(config_path.clone())));
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok((config, ConfigSource::DefaultFile)),
        Ok(None) => Ok((Config::default(), ConfigSource::Builtin)),
        Err(e) => Ok((Config::default(), ConfigSource::Invalid(e))),
    }
}

/// Where the configuration came from, logged once logging is up.
enum ConfigSource {
    Explicit(PathBuf),
    DefaultFile,
    Builtin,
    Invalid(anyhow::Error),
}

impl ConfigSource {
    fn log(&self) {
        match self {
            Self::Explicit(path) => info!("Loaded config from: {}", path.display()),
            Self::DefaultFile => info!("Loaded default config from {}", CONFIG_FILE_NAME),
            Self::Builtin => debug!("No config file found, using defaults"),
            Self::Invalid(e) => warn!("Failed to load config, using defaults: {:#}", e),
        }
    }
}
