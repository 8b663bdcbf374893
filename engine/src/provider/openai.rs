use super::{
    resolve_api_key, status_to_error, Completion, CompletionProvider, CompletionRequest,
    ProviderError, Result,
};
use crate::config::OpenAIConfig;
use async_trait::async_trait;
use serde_json::json;

/// Environment variable holding the OpenAI API key
pub const OPENAI_API_KEY_ENV: &str = "FOREMAN_OPENAI_API_KEY";

pub struct OpenAIProvider {
    config: OpenAIConfig,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: OpenAIConfig) -> Result<Self> {
        let api_key = resolve_api_key(OPENAI_API_KEY_ENV, config.api_key.as_deref())?;
        Ok(Self {
            config,
            api_key,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let url = format!("{}/chat/completions", self.config.base_url);

        let mut api_messages = Vec::new();
        for msg in &request.messages {
            api_messages.push(json!({
                "role": msg.role.to_string(),
                "content": msg.content
            }));
        }

        let payload = json!({
            "model": self.config.model,
            "messages": api_messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(status_to_error(status, text));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let content = data
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| ProviderError::Parse("No content in response".to_string()))?;

        if content.trim().is_empty() {
            return Err(ProviderError::Parse("Empty content".to_string()));
        }

        let token_usage = data
            .get("usage")
            .and_then(|u| u.get("total_tokens"))
            .and_then(|t| t.as_i64())
            .unwrap_or(0);

        Ok(Completion {
            content: content.to_string(),
            token_usage,
        })
    }
}
