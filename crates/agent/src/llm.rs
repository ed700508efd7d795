use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use concierge_core::config::LlmConfig;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LlmError {
    #[error("llm transport failure: {0}")]
    Transport(String),
    #[error("llm call timed out")]
    Timeout,
    #[error("llm returned an empty response")]
    EmptyResponse,
}

/// Chat access to the model provider. `chat_json` constrains the output
/// with a JSON schema; `chat_text` returns free-form text.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_json(
        &self,
        system: &str,
        user: &str,
        format_schema: &Value,
    ) -> Result<String, LlmError>;

    async fn chat_text(&self, system: &str, user: &str) -> Result<String, LlmError>;
}

/// Client for an Ollama-compatible `/api/chat` endpoint.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl OllamaClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|error| LlmError::Transport(error.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }

    async fn chat(&self, body: Value) -> Result<String, LlmError> {
        let url = format!("{}/api/chat", self.base_url);
        let mut last_error = LlmError::EmptyResponse;

        for _attempt in 0..=self.max_retries {
            let mut request = self.client.post(&url).json(&body);
            if let Some(api_key) = &self.api_key {
                request = request.bearer_auth(api_key.expose_secret());
            }

            match request.send().await {
                Ok(response) => {
                    let response = match response.error_for_status() {
                        Ok(response) => response,
                        Err(error) => {
                            last_error = LlmError::Transport(error.to_string());
                            continue;
                        }
                    };
                    match response.json::<ChatResponse>().await {
                        Ok(parsed) => {
                            let content = parsed
                                .message
                                .map(|message| message.content)
                                .unwrap_or_default();
                            if content.trim().is_empty() {
                                last_error = LlmError::EmptyResponse;
                                continue;
                            }
                            return Ok(content);
                        }
                        Err(error) => {
                            last_error = LlmError::Transport(error.to_string());
                            continue;
                        }
                    }
                }
                Err(error) if error.is_timeout() => {
                    last_error = LlmError::Timeout;
                    continue;
                }
                Err(error) => {
                    last_error = LlmError::Transport(error.to_string());
                    continue;
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat_json(
        &self,
        system: &str,
        user: &str,
        format_schema: &Value,
    ) -> Result<String, LlmError> {
        self.chat(json!({
            "model": self.model,
            "stream": false,
            "format": format_schema,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        }))
        .await
    }

    async fn chat_text(&self, system: &str, user: &str) -> Result<String, LlmError> {
        self.chat(json!({
            "model": self.model,
            "stream": false,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        }))
        .await
    }
}
