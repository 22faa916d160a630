//! Streaming modules.
//!
//! This module exposes one-shot blocking calls as an asynchronous sequence
//! of text chunks.

pub mod bridge;

pub use bridge::{ChunkStream, PartialSink, StreamBridge, StreamSession, STREAM_ERROR_PREFIX};
