//! Fan-in aggregation and run statistics.
//!
//! This module joins fan-out results into the text handed to later stages
//! and computes summary statistics over one or more runs.

use crate::models::{PipelineRun, RunState, StageResult};
use serde::{Deserialize, Serialize};

/// Separator placed between fan-out results.
pub const FAN_OUT_SEPARATOR: &str = "\n\n";

/// Concatenate fan-out results in the order given.
pub fn join_fan_out(results: &[StageResult]) -> String {
    results
        .iter()
        .map(|r| r.content.as_str())
        .collect::<Vec<_>>()
        .join(FAN_OUT_SEPARATOR)
}

/// All stage results of a run, in sequence order.
pub fn stages_in_order(run: &PipelineRun) -> Vec<&StageResult> {
    let mut stages: Vec<&StageResult> = run
        .fan_out
        .iter()
        .chain(run.reflection.iter())
        .chain(run.final_result.iter())
        .collect();
    stages.sort_by_key(|s| s.sequence);
    stages
}

/// Outcome counts over a set of runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Requests turned away by the rate limiter, never run.
    pub rate_limited: usize,
    /// Requests rejected before any agent call.
    pub rejected: usize,
    pub total_duration_seconds: f64,
}

impl BatchSummary {
    pub fn from_runs(runs: &[PipelineRun]) -> Self {
        let mut summary = Self::default();
        for run in runs {
            summary.add_run(run);
        }
        summary
    }

    pub fn add_run(&mut self, run: &PipelineRun) {
        self.total += 1;
        match run.state {
            RunState::Succeeded => self.succeeded += 1,
            _ => self.failed += 1,
        }
        self.total_duration_seconds += run.duration_seconds();
    }

    pub fn add_rate_limited(&mut self) {
        self.total += 1;
        self.rate_limited += 1;
    }

    pub fn add_rejected(&mut self) {
        self.total += 1;
        self.rejected += 1;
    }

    /// Whether every request produced a successful run.
    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }

    pub fn average_duration_seconds(&self) -> f64 {
        let runs = self.succeeded + self.failed;
        if runs == 0 {
            0.0
        } else {
            self.total_duration_seconds / runs as f64
        }
    }
}
