//! Agent invokers.
//!
//! This module defines the agent capability trait and its backends: an
//! Ollama HTTP invoker and a scripted invoker for dry runs and tests.

pub mod invoker;
pub mod ollama;
pub mod scripted;

pub use invoker::{AgentInvoker, InvokerFactory};
pub use ollama::{OllamaInvokerFactory, OllamaSettings};
pub use scripted::{RecordedCall, Reply, ScriptedFactory};
