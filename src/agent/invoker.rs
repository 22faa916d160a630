//! The agent capability boundary.
//!
//! The pipeline only ever sees an agent as "prompt in, text out". Any
//! backend (HTTP model server, local model, scripted stub) plugs in by
//! implementing [`AgentInvoker`] and an [`InvokerFactory`] that binds it to
//! a role.

use crate::models::AgentRole;
use crate::stream::PartialSink;
use anyhow::Result;
use std::sync::Arc;

/// A blocking, potentially slow and potentially failing agent call bound to
/// exactly one role.
///
/// Calls run on the worker pool, never directly on the async executor.
pub trait AgentInvoker: Send + Sync {
    /// The role this invoker is bound to.
    fn role(&self) -> &AgentRole;

    /// Send a prompt and wait for the complete response.
    fn invoke(&self, prompt: &str) -> Result<String>;

    /// Like [`invoke`](Self::invoke), publishing partial output as it arrives.
    ///
    /// Backends without incremental output keep the default, which publishes
    /// nothing.
    fn invoke_streaming(&self, prompt: &str, partials: &PartialSink) -> Result<String> {
        let _ = partials;
        self.invoke(prompt)
    }
}

/// Builds invokers for roles. One invoker is built per role per run.
pub trait InvokerFactory: Send + Sync {
    fn build(&self, role: &AgentRole) -> Result<Arc<dyn AgentInvoker>>;
}
