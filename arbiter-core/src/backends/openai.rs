//! OpenAI-compatible chat completions backend.
//!
//! Works with OpenAI and any endpoint that follows the chat completions API
//! (Azure OpenAI, Ollama, vLLM, LM Studio). The prompt is sent as a single
//! user message; the reply text is `choices[0].message.content`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use super::Backend;
use crate::config::{BackendConfig, resolve_api_key};
use crate::error::{BackendErrorKind, ConfigError};

pub struct OpenAiChatBackend {
    client: Client,
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
}

impl OpenAiChatBackend {
    /// Create a backend, reading the API key from `config.api_key_env`.
    ///
    /// Local endpoints (localhost / 127.0.0.1) do not need a key.
    pub fn new(config: &BackendConfig) -> Result<Self, ConfigError> {
        let is_local = config
            .base_url
            .as_ref()
            .map(|u| u.contains("localhost") || u.contains("127.0.0.1"))
            .unwrap_or(false);

        let api_key = match resolve_api_key(&config.api_key_env) {
            Ok(key) => key,
            Err(_) if is_local => {
                debug!(backend = %config.name, "No API key set for local endpoint; using placeholder");
                "local".to_string()
            }
            Err(e) => return Err(e),
        };
        Ok(Self::new_with_key(config, api_key))
    }

    /// Create a backend with an explicitly provided API key.
    pub fn new_with_key(config: &BackendConfig, api_key: String) -> Self {
        let model = if config.model.is_empty() {
            config.name.clone()
        } else {
            config.model.clone()
        };
        Self {
            client: Client::new(),
            name: config.name.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    fn request_body(&self, prompt: &str) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": false,
        });
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }

    /// Extract the reply text from a chat completions body.
    fn parse_response(body: &Value) -> Result<String, BackendErrorKind> {
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| BackendErrorKind::MalformedResponse {
                message: "No choices in response".to_string(),
            })?;

        choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| BackendErrorKind::MalformedResponse {
                message: "No text content in first choice".to_string(),
            })
    }
}

#[async_trait]
impl Backend for OpenAiChatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, prompt: &str) -> Result<String, BackendErrorKind> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, backend = %self.name, "Sending chat completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| BackendErrorKind::from_transport(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendErrorKind::from_transport(&e))?;

        if !status.is_success() {
            return Err(BackendErrorKind::from_status(status, &text));
        }

        let json: Value =
            serde_json::from_str(&text).map_err(|e| BackendErrorKind::MalformedResponse {
                message: format!("Invalid JSON: {}", e),
            })?;
        Self::parse_response(&json)
    }
}
