//! Markdown and JSON report generation.
//!
//! This module renders a pipeline run, or a batch of runs, as a report.

use crate::analysis::{stages_in_order, BatchSummary};
use crate::models::{PipelineRun, RunState, StageKind, StageResult};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Output format for reports.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl ReportFormat {
    pub fn render(&self, report: &RunReport) -> Result<String> {
        match self {
            ReportFormat::Markdown => Ok(generate_markdown_report(report)),
            ReportFormat::Json => generate_json_report(report),
        }
    }
}

/// Report metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Memory key of the analyzed subject.
    pub subject: String,
    pub analysis_date: DateTime<Utc>,
    pub model_used: String,
    pub stages_completed: usize,
    pub duration_seconds: f64,
}

/// A single run as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub metadata: ReportMetadata,
    pub run: PipelineRun,
}

impl RunReport {
    pub fn new(run: PipelineRun, subject: impl Into<String>, model_used: impl Into<String>) -> Self {
        Self {
            metadata: ReportMetadata {
                subject: subject.into(),
                analysis_date: run.completed_at.unwrap_or_else(Utc::now),
                model_used: model_used.into(),
                stages_completed: run.stage_count(),
                duration_seconds: run.duration_seconds(),
            },
            run,
        }
    }
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &RunReport) -> String {
    let mut output = String::new();

    output.push_str("# Business Analysis Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata, &report.run));
    output.push_str(&generate_context_section(&report.run));

    if report.run.state == RunState::Failed {
        output.push_str(&generate_failure_section(&report.run));
    }

    output.push_str(&generate_stages_section(&report.run));

    if let Some(ref result) = report.run.final_result {
        output.push_str("## Final Recommendations\n\n");
        output.push_str(result.content.trim());
        output.push_str("\n\n");
    }

    output.push_str(&generate_footer());
    output
}

fn generate_metadata_section(metadata: &ReportMetadata, run: &PipelineRun) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Run:** `{}`\n", run.id));
    section.push_str(&format!("- **Subject:** {}\n", metadata.subject));
    section.push_str(&format!("- **Status:** {} {}\n", run.state.emoji(), run.state));
    section.push_str(&format!(
        "- **Analysis Date:** {}\n",
        metadata.analysis_date.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Model Used:** `{}`\n", metadata.model_used));
    section.push_str(&format!(
        "- **Stages Completed:** {}\n",
        metadata.stages_completed
    ));
    section.push_str(&format!(
        "- **Analysis Duration:** {:.1}s\n\n",
        metadata.duration_seconds
    ));

    section
}

fn generate_context_section(run: &PipelineRun) -> String {
    if run.request.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Business Context\n\n");
    section.push_str("| Field | Value |\n");
    section.push_str("|:---|:---|\n");
    for (key, value) in run.request.fields() {
        section.push_str(&format!("| {} | {} |\n", key, value.replace('\n', " ")));
    }
    section.push('\n');
    section
}

fn generate_failure_section(run: &PipelineRun) -> String {
    format!("## Failure\n\n> {}\n\n", run.content())
}

fn generate_stages_section(run: &PipelineRun) -> String {
    let stages: Vec<&StageResult> = stages_in_order(run)
        .into_iter()
        .filter(|s| s.stage != StageKind::Synthesis)
        .collect();
    if stages.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Analysis\n\n");
    for stage in stages {
        let heading = match stage.stage {
            StageKind::Reflection => "Self-Reflection".to_string(),
            _ => stage.role.clone(),
        };
        section.push_str(&format!("### {}. {}\n\n", stage.sequence, heading));
        section.push_str(stage.content.trim());
        section.push_str("\n\n");
    }
    section
}

fn generate_footer() -> String {
    "---\n\n*Report generated by analystflow*\n".to_string()
}

/// Generate a JSON report.
pub fn generate_json_report(report: &RunReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Generate the Markdown summary of a batch.
pub fn generate_batch_report(summary: &BatchSummary, reports: &[RunReport]) -> String {
    let mut output = String::new();

    output.push_str("# Batch Analysis Report\n\n");
    output.push_str("| ✅ Succeeded | ❌ Failed | ⛔ Rate limited | Rejected | **Total** |\n");
    output.push_str("|:---:|:---:|:---:|:---:|:---:|\n");
    output.push_str(&format!(
        "| {} | {} | {} | {} | **{}** |\n\n",
        summary.succeeded, summary.failed, summary.rate_limited, summary.rejected, summary.total
    ));
    output.push_str(&format!(
        "Average run duration: {:.1}s\n\n",
        summary.average_duration_seconds()
    ));

    if !reports.is_empty() {
        output.push_str("## Runs\n\n");
        output.push_str("| Subject | Status | Stages | Duration |\n");
        output.push_str("|:---|:---:|:---:|:---:|\n");
        for report in reports {
            output.push_str(&format!(
                "| {} | {} {} | {} | {:.1}s |\n",
                report.metadata.subject,
                report.run.state.emoji(),
                report.run.state,
                report.metadata.stages_completed,
                report.metadata.duration_seconds
            ));
        }
        output.push('\n');
    }

    output.push_str(&generate_footer());
    output
}
