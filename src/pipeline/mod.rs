//! The multi-agent analysis pipeline.
//!
//! This module holds the orchestrator, the prompt templates it fills in and
//! the memory it writes finished analyses to.

pub mod memory;
pub mod orchestrator;
pub mod prompts;

pub use memory::{memory_key, AnalysisMemory};
pub use orchestrator::PipelineOrchestrator;
pub use prompts::validate_message;
