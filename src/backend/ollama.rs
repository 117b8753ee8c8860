//! Ollama chat API backend.
//!
//! Sends one system + user message pair per call and returns the
//! assistant content. Transport errors are mapped onto [`BackendError`].

use super::TextBackend;
use crate::error::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for the Ollama backend.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub ollama_url: String,
    pub model_name: String,
    pub temperature: f32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model_name: "llama3.2:latest".to_string(),
            temperature: 0.1,
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
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: &'static str,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: usize,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

/// Text backend talking to a local or remote Ollama server.
pub struct OllamaBackend {
    config: OllamaConfig,
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new backend. Fails only if the HTTP client cannot be built.
    pub fn new(config: OllamaConfig) -> anyhow::Result<Self> {
        info!(
            "Initializing Ollama backend with model {} at {}",
            config.model_name, config.ollama_url
        );

        let http_client = reqwest::Client::builder().build()?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn build_request(&self, prompt: &str, max_tokens: usize) -> OllamaChatRequest {
        OllamaChatRequest {
            model: self.config.model_name.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            stream: false,
            format: "json",
            options: OllamaOptions {
                temperature: self.config.temperature,
                num_predict: max_tokens,
            },
        }
    }
}

#[async_trait]
impl TextBackend for OllamaBackend {
    async fn complete(
        &self,
        prompt: &str,
        max_tokens: usize,
        timeout: Duration,
    ) -> Result<String, BackendError> {
        let url = format!("{}/api/chat", self.config.ollama_url);
        let request = self.build_request(prompt, max_tokens);

        debug!("Sending chat request to {} ({} prompt bytes)", url, prompt.len());

        let response = self
            .http_client
            .post(&url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(timeout)
                } else if e.is_connect() {
                    BackendError::Unavailable(format!(
                        "cannot connect to Ollama at {}",
                        self.config.ollama_url
                    ))
                } else {
                    BackendError::Unavailable(format!("failed to send request: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Unavailable(format!(
                "Ollama API error {}: {}",
                status, body
            )));
        }

        let chat_response: OllamaChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(timeout)
            } else {
                BackendError::InvalidResponse(format!("failed to parse Ollama response: {}", e))
            }
        })?;

        Ok(chat_response.message.content)
    }

    fn name(&self) -> &str {
        &self.config.model_name
    }
}

/// System prompt shared by every agent; each agent adds its own task.
const SYSTEM_PROMPT: &str = r#"You are a clinical reasoning component inside a decision-support pipeline.
You never address the patient. You answer with exactly one JSON object and nothing else.
Probabilities are between 0 and 1 and must sum to at most 1.
Confidence is your own calibrated confidence in the answer, between 0 and 1."#;
