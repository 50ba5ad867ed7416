use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ProviderError;

pub const DEFAULT_GEMINI_API_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent";

/// Text-completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_url: String,
    pub api_key: String,
    /// Upper bound on a single request, so one slow call cannot pin a worker.
    pub timeout: Duration,
}

/// Google Gemini `generateContent` client.
pub struct GeminiProvider {
    config: GeminiConfig,
    client: Client,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl CompletionProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(&self.config.api_url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&json!({
                "contents": [{ "parts": [{ "text": prompt }] }]
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        debug!(bytes = body.len(), "Gemini response received");
        parse_completion(&body)
    }
}

/// Pulls `candidates[0].content.parts[0].text` out of a response body.
fn parse_completion(body: &str) -> Result<String, ProviderError> {
    let data: Value = serde_json::from_str(body)
        .map_err(|e| ProviderError::Malformed(format!("non-JSON body: {}", e)))?;

    data.pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Malformed("no candidate text".to_string()))
}

/// Human-readable reply stored in the room when every attempt failed.
pub fn fallback_reply(err: &ProviderError) -> String {
    match err {
        ProviderError::Timeout => "[Assistant error: the completion service timed out]".to_string(),
        ProviderError::Transport(_) => {
            "[Assistant error: the completion service is unreachable]".to_string()
        }
        ProviderError::Status(code) => {
            format!("[Assistant error: the completion service returned status {}]", code)
        }
        ProviderError::Malformed(_) => {
            "[Assistant error: the completion service sent an unreadable response]".to_string()
        }
    }
}
