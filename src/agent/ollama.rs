//! Ollama-backed agent invoker.
//!
//! Talks to Ollama's `/api/chat` endpoint. The HTTP client is asynchronous;
//! the blocking [`AgentInvoker`] contract is met by driving each request on
//! the runtime handle captured when the factory was created, from the worker
//! thread the call runs on.

use crate::agent::invoker::{AgentInvoker, InvokerFactory};
use crate::config::ModelConfig;
use crate::models::AgentRole;
use crate::stream::PartialSink;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Connection settings shared by every invoker a factory builds.
#[derive(Debug, Clone)]
pub struct OllamaSettings {
    pub ollama_url: String,
    pub default_model: String,
    pub timeout_seconds: u64,
    pub max_tokens: Option<u32>,
    /// Request NDJSON streaming and publish each delta.
    pub stream_partials: bool,
}

impl From<&ModelConfig> for OllamaSettings {
    fn from(config: &ModelConfig) -> Self {
        Self {
            ollama_url: config.ollama_url.trim_end_matches('/').to_string(),
            default_model: config.name.clone(),
            timeout_seconds: config.timeout_seconds,
            max_tokens: config.max_tokens,
            stream_partials: config.stream_partials,
        }
    }
}

/// Message in the chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

/// Ollama chat API response, or one line of a streamed response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

/// Builds [`OllamaInvoker`]s sharing one HTTP client.
pub struct OllamaInvokerFactory {
    settings: Arc<OllamaSettings>,
    http_client: reqwest::Client,
    runtime: Handle,
}

impl OllamaInvokerFactory {
    /// Must be called from within a Tokio runtime.
    pub fn new(settings: OllamaSettings) -> Result<Self> {
        let runtime =
            Handle::try_current().context("Ollama invokers need a running Tokio runtime")?;

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        info!(
            "Using Ollama at {} (default model {})",
            settings.ollama_url, settings.default_model
        );

        Ok(Self {
            settings: Arc::new(settings),
            http_client,
            runtime,
        })
    }
}

impl InvokerFactory for OllamaInvokerFactory {
    fn build(&self, role: &AgentRole) -> Result<Arc<dyn AgentInvoker>> {
        Ok(Arc::new(OllamaInvoker {
            role: role.clone(),
            settings: self.settings.clone(),
            http_client: self.http_client.clone(),
            runtime: self.runtime.clone(),
        }))
    }
}

/// One role bound to an Ollama model.
pub struct OllamaInvoker {
    role: AgentRole,
    settings: Arc<OllamaSettings>,
    http_client: reqwest::Client,
    runtime: Handle,
}

impl OllamaInvoker {
    fn model(&self) -> &str {
        self.role
            .model
            .as_deref()
            .unwrap_or(&self.settings.default_model)
    }

    fn build_request<'a>(&'a self, prompt: &str, stream: bool) -> OllamaChatRequest<'a> {
        OllamaChatRequest {
            model: self.model(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: self.role.instructions.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            stream,
            options: OllamaOptions {
                temperature: self.role.temperature,
                num_predict: self.settings.max_tokens,
            },
        }
    }

    /// Send a prompt and return the response text.
    async fn send_prompt(&self, prompt: &str, partials: Option<&PartialSink>) -> Result<String> {
        let url = format!("{}/api/chat", self.settings.ollama_url);
        let request = self.build_request(prompt, partials.is_some());

        debug!(
            "Sending prompt for role {} to model {} ({} chars)",
            self.role.name,
            self.model(),
            prompt.len()
        );

        let mut builder = self.http_client.post(&url).json(&request);
        if let Some(ref key) = self.role.credential {
            builder = builder.bearer_auth(key);
        }

        let mut response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow::anyhow!("Request timed out after {}s", self.settings.timeout_seconds)
            } else if e.is_connect() {
                anyhow::anyhow!("Cannot connect to Ollama at {}", self.settings.ollama_url)
            } else {
                anyhow::anyhow!("Failed to send request: {}", e)
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Ollama API error {}: {}", status, body));
        }

        let Some(partials) = partials else {
            let chat_response: OllamaChatResponse = response
                .json()
                .await
                .context("Failed to parse Ollama response")?;
            return into_content(chat_response);
        };

        // NDJSON: one response object per line, possibly split across chunks.
        let mut buffer = String::new();
        let mut full = String::new();
        while let Some(bytes) = response
            .chunk()
            .await
            .context("Failed to read Ollama stream")?
        {
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                if let Some(delta) = parse_stream_line(&line)? {
                    partials.publish(delta.as_str());
                    full.push_str(&delta);
                }
            }
        }
        if let Some(delta) = parse_stream_line(&buffer)? {
            partials.publish(delta.as_str());
            full.push_str(&delta);
        }

        Ok(full)
    }
}

fn into_content(response: OllamaChatResponse) -> Result<String> {
    if let Some(error) = response.error {
        return Err(anyhow::anyhow!("Ollama returned an error: {}", error));
    }
    response
        .message
        .map(|m| m.content)
        .ok_or_else(|| anyhow::anyhow!("Ollama response has no message"))
}

/// Parse one NDJSON line of a streamed response into its content delta.
fn parse_stream_line(line: &str) -> Result<Option<String>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: OllamaChatResponse =
        serde_json::from_str(line).context("Failed to parse Ollama stream line")?;
    if chunk.done && chunk.message.is_none() {
        return Ok(None);
    }
    into_content(chunk).map(|content| Some(content).filter(|c| !c.is_empty()))
}

impl AgentInvoker for OllamaInvoker {
    fn role(&self) -> &AgentRole {
        &self.role
    }

    fn invoke(&self, prompt: &str) -> Result<String> {
        self.runtime.block_on(self.send_prompt(prompt, None))
    }

    fn invoke_streaming(&self, prompt: &str, partials: &PartialSink) -> Result<String> {
        if self.settings.stream_partials {
            self.runtime.block_on(self.send_prompt(prompt, Some(partials)))
        } else {
            self.invoke(prompt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> OllamaSettings {
        OllamaSettings {
            ollama_url: "http://localhost:11434".to_string(),
            default_model: "llama3.2:latest".to_string(),
            timeout_seconds: 5,
            max_tokens: Some(512),
            stream_partials: false,
        }
    }

    #[tokio::test]
    async fn test_request_uses_role_settings() {
        let factory = OllamaInvokerFactory::new(settings()).unwrap();
        let role = AgentRole::new("opportunity-finding", "Find opportunities", 0.7)
            .with_model(Some("qwen2.5:7b".to_string()));
        let invoker = OllamaInvoker {
            role,
            settings: factory.settings.clone(),
            http_client: factory.http_client.clone(),
            runtime: factory.runtime.clone(),
        };

        let request = invoker.build_request("Identify opportunities:\nmanual invoicing", false);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "qwen2.5:7b");
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], "Find opportunities");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["options"]["num_predict"], 512);
        assert!((json["options"]["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_settings_from_model_config() {
        let config = ModelConfig {
            ollama_url: "http://ollama:11434/".to_string(),
            ..ModelConfig::default()
        };
        let settings = OllamaSettings::from(&config);
        assert_eq!(settings.ollama_url, "http://ollama:11434");
        assert_eq!(settings.default_model, "llama3.2:latest");
    }

    #[test]
    fn test_parse_stream_lines() {
        let delta = parse_stream_line(r#"{"message":{"role":"assistant","content":"Hel"},"done":false}"#)
            .unwrap();
        assert_eq!(delta.as_deref(), Some("Hel"));

        let last = parse_stream_line(r#"{"done":true,"total_duration":123}"#).unwrap();
        assert_eq!(last, None);

        assert_eq!(parse_stream_line("   ").unwrap(), None);
        assert!(parse_stream_line(r#"{"error":"model not found"}"#).is_err());
        assert!(parse_stream_line("not json").is_err());
    }

    #[test]
    fn test_factory_requires_runtime() {
        assert!(OllamaInvokerFactory::new(settings()).is_err());
    }
}
