use super::{
    resolve_api_key, status_to_error, Completion, CompletionProvider, CompletionRequest,
    MessageRole, ProviderError, Result,
};
use crate::config::AnthropicConfig;
use async_trait::async_trait;
use serde_json::json;

/// Environment variable holding the Anthropic API key
pub const ANTHROPIC_API_KEY_ENV: &str = "FOREMAN_ANTHROPIC_API_KEY";

pub struct AnthropicProvider {
    config: AnthropicConfig,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        let api_key = resolve_api_key(ANTHROPIC_API_KEY_ENV, config.api_key.as_deref())?;
        Ok(Self {
            config,
            api_key,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let url = format!("{}/messages", self.config.base_url);

        // Anthropic takes system prompts out-of-band rather than in the
        // messages array.
        let mut system_prompt = String::new();
        let mut api_messages = Vec::new();
        for msg in &request.messages {
            if msg.role == MessageRole::System {
                system_prompt.push_str(&msg.content);
                system_prompt.push('\n');
                continue;
            }
            api_messages.push(json!({
                "role": if msg.role == MessageRole::Assistant { "assistant" } else { "user" },
                "content": msg.content
            }));
        }

        let payload = json!({
            "model": self.config.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "system": system_prompt,
            "messages": api_messages,
        });

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
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

        let content_arr = data
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| ProviderError::Parse("No content array in response".to_string()))?;

        let mut full_content = String::new();
        for item in content_arr {
            if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                full_content.push_str(text);
            }
        }

        if full_content.trim().is_empty() {
            return Err(ProviderError::Parse("Empty content".to_string()));
        }

        let token_usage = data
            .get("usage")
            .map(|u| {
                u.get("input_tokens").and_then(|t| t.as_i64()).unwrap_or(0)
                    + u.get("output_tokens").and_then(|t| t.as_i64()).unwrap_or(0)
            })
            .unwrap_or(0);

        Ok(Completion {
            content: full_content,
            token_usage,
        })
    }
}
