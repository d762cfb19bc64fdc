//! Chat-completion client for OpenAI-compatible endpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::config::LlmConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Complete with a specific model. Clients bound to one model ignore it.
    async fn complete_with_model(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        let _ = model;
        self.complete(messages).await
    }

    fn model_name(&self) -> &str;
}

pub struct OpenAiChatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let base = config.base_url.trim_end_matches('/');
        let endpoint = if base.ends_with("/v1") || base.contains("/v1/") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        };
        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[instrument(skip_all, fields(model = %model, messages = messages.len()))]
    async fn send(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": false,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("completion request returned {}: {}", status, text)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::Llm(format!("invalid completion response: {}", e)))?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| Error::Llm("completion response has no message content".to_string()))?;
        debug!(chars = content.len(), "completion received");
        Ok(content.to_string())
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        self.send(&self.model, messages).await
    }

    async fn complete_with_model(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        self.send(model, messages).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Pull a JSON value out of a model reply that may wrap it in a markdown
/// code fence or surround it with prose.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            if let Ok(value) = serde_json::from_str(body[..end].trim()) {
                return Some(value);
            }
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_fenced_and_embedded_json() {
        assert_eq!(extract_json(r#"{"a": 1}"#), Some(json!({"a": 1})));
        assert_eq!(
            extract_json("```json\n{\"intents\": [\"valuation\"]}\n```"),
            Some(json!({"intents": ["valuation"]}))
        );
        assert_eq!(
            extract_json("Sure! Here it is: {\"a\": [1, 2]} Hope that helps."),
            Some(json!({"a": [1, 2]}))
        );
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn endpoint_normalization() {
        let mut config = LlmConfig::default();
        config.base_url = "http://localhost:11434/".to_string();
        assert_eq!(
            OpenAiChatClient::new(&config).unwrap().endpoint(),
            "http://localhost:11434/v1/chat/completions"
        );
        config.base_url = "https://api.openai.com/v1".to_string();
        assert_eq!(
            OpenAiChatClient::new(&config).unwrap().endpoint(),
            "https://api.openai.com/v1/chat/completions"
        );
    }
}
