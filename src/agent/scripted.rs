//! Scripted agents for dry runs and tests.
//!
//! Each role follows a script: echo the prompt, answer with fixed text, or
//! fail, optionally after a delay and after publishing partial chunks. Every
//! completed call is recorded in completion order.

use crate::agent::invoker::{AgentInvoker, InvokerFactory};
use crate::models::AgentRole;
use crate::stream::PartialSink;
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What a scripted role answers.
#[derive(Debug, Clone)]
pub enum Reply {
    /// `[role] <first prompt line>`
    Echo,
    Text(String),
    Fail(String),
}

#[derive(Debug, Clone)]
struct Script {
    reply: Reply,
    delay: Duration,
    partials: Vec<String>,
    fail_on: Option<(String, String)>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            reply: Reply::Echo,
            delay: Duration::ZERO,
            partials: Vec::new(),
            fail_on: None,
        }
    }
}

/// A call observed by a scripted invoker.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub role: String,
    pub prompt: String,
    pub credential: Option<String>,
}

/// Factory handing out scripted invokers.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl ScriptedFactory {
    /// Every role echoes its prompt until scripted otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    fn edit(self, role: &str, f: impl FnOnce(&mut Script)) -> Self {
        f(self.scripts.lock().entry(role.to_string()).or_default());
        self
    }

    pub fn reply(self, role: &str, text: impl Into<String>) -> Self {
        let text = text.into();
        self.edit(role, |s| s.reply = Reply::Text(text))
    }

    pub fn fail(self, role: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        self.edit(role, |s| s.reply = Reply::Fail(message))
    }

    /// Fail with `message` only for prompts containing `needle`.
    pub fn fail_when(
        self,
        role: &str,
        needle: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let rule = (needle.into(), message.into());
        self.edit(role, |s| s.fail_on = Some(rule))
    }

    pub fn delay(self, role: &str, delay: Duration) -> Self {
        self.edit(role, |s| s.delay = delay)
    }

    /// Chunks published before the reply when called through a stream.
    pub fn partials(self, role: &str, chunks: &[&str]) -> Self {
        let chunks = chunks.iter().map(|c| c.to_string()).collect();
        self.edit(role, |s| s.partials = chunks)
    }

    /// All completed calls, in completion order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, role: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.role == role)
            .cloned()
            .collect()
    }
}

impl InvokerFactory for ScriptedFactory {
    fn build(&self, role: &AgentRole) -> Result<Arc<dyn AgentInvoker>> {
        let script = self
            .scripts
            .lock()
            .get(&role.name)
            .cloned()
            .unwrap_or_default();

        Ok(Arc::new(ScriptedInvoker {
            role: role.clone(),
            script,
            calls: self.calls.clone(),
        }))
    }
}

struct ScriptedInvoker {
    role: AgentRole,
    script: Script,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl ScriptedInvoker {
    fn answer(&self, prompt: &str, partials: Option<&PartialSink>) -> Result<String> {
        if let Some(sink) = partials {
            for chunk in &self.script.partials {
                sink.publish(chunk.as_str());
            }
        }
        if !self.script.delay.is_zero() {
            std::thread::sleep(self.script.delay);
        }

        self.calls.lock().push(RecordedCall {
            role: self.role.name.clone(),
            prompt: prompt.to_string(),
            credential: self.role.credential.clone(),
        });

        if let Some((needle, message)) = &self.script.fail_on {
            if prompt.contains(needle.as_str()) {
                return Err(anyhow::anyhow!("{}", message));
            }
        }

        match &self.script.reply {
            Reply::Echo => Ok(format!(
                "[{}] {}",
                self.role.name,
                prompt.trim().lines().next().unwrap_or_default()
            )),
            Reply::Text(text) => Ok(text.clone()),
            Reply::Fail(message) => Err(anyhow::anyhow!("{}", message)),
        }
    }
}

impl AgentInvoker for ScriptedInvoker {
    fn role(&self) -> &AgentRole {
        &self.role
    }

    fn invoke(&self, prompt: &str) -> Result<String> {
        self.answer(prompt, None)
    }

    fn invoke_streaming(&self, prompt: &str, partials: &PartialSink) -> Result<String> {
        self.answer(prompt, Some(partials))
    }
}
