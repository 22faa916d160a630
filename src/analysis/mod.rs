//! Analysis modules.
//!
//! This module joins fan-out output and summarizes completed runs.

pub mod aggregator;

pub use aggregator::*;
