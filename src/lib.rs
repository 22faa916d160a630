//! AnalystFlow - multi-agent business analysis pipeline.
//!
//! Runs several specialist agent roles in parallel over one request,
//! reflects on their combined output and synthesizes final recommendations.
//! Blocking agent calls run on a bounded worker pool and can be observed as
//! a stream of chunks. A sliding-window rate limiter and a size-triggered
//! batch processor guard and group incoming work.

pub mod agent;
pub mod analysis;
pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod limiter;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod stream;
pub mod worker;

pub use agent::{AgentInvoker, InvokerFactory};
pub use batch::{BatchItem, BatchProcessor};
pub use error::{PipelineError, WorkerError};
pub use limiter::RateLimiter;
pub use models::{AgentRole, MemoryEntry, PipelineRequest, PipelineRun, RunState, StageResult};
pub use pipeline::{AnalysisMemory, PipelineOrchestrator};
pub use stream::{ChunkStream, PartialSink, StreamBridge};
pub use worker::WorkerPool;
