//! Model provider abstraction layer
//!
//! This module provides a common interface for the cloud completion
//! providers (OpenAI, Anthropic). The CompletionProvider trait defines the
//! contract all providers implement, so the gateway and the pipeline stay
//! provider-agnostic. It also hosts the lenient JSON extraction helpers the
//! pipeline uses to read structured output out of free-form model text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod anthropic;
pub mod gateway;
pub mod openai;

pub use gateway::{CallCategory, ProviderGateway, RetryPolicy};

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur during provider calls
///
/// The taxonomy matters downstream: transient failures retry with backoff,
/// quota failures retry after a longer pause, invalid requests never retry.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Transient(String),

    #[error("Quota exhausted: {0}")]
    Quota(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Unparseable response: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Network-level hiccups that a quick retry can fix
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::Timeout)
    }

    /// Anything a retry with backoff might fix, including quota pressure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::Timeout | ProviderError::Quota(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Transient(e.to_string())
        }
    }
}

impl From<ProviderError> for crate::errors::EngineError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Quota(msg) => crate::errors::EngineError::ProviderQuota(msg),
            ProviderError::Timeout => crate::errors::EngineError::ProviderTimeout,
            other => crate::errors::EngineError::Provider(other.to_string()),
        }
    }
}

/// Map an HTTP error status to the provider error taxonomy
pub(crate) fn status_to_error(status: reqwest::StatusCode, body: String) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(body),
        429 => ProviderError::Quota(body),
        500..=599 => ProviderError::Transient(body),
        _ => ProviderError::Invalid(body),
    }
}

/// Resolve an API key, preferring the environment over the config file.
///
/// Keys in the config file are a convenience for local setups; the
/// environment wins so deployments never depend on keys on disk.
pub(crate) fn resolve_api_key(env_var: &str, configured: Option<&str>) -> Result<String> {
    if let Ok(value) = std::env::var(env_var) {
        if !value.trim().is_empty() {
            return Ok(value);
        }
    }
    match configured {
        Some(key) if !key.trim().is_empty() => Ok(key.to_string()),
        _ => Err(ProviderError::Auth(format!(
            "No API key found; set {} or add it to the config file",
            env_var
        ))),
    }
}

/// Message in a completion request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Role of the message sender (system, user, assistant)
    pub role: MessageRole,

    /// Content of the message
    pub content: String,
}

impl Message {
    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A completion request against a provider
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Conversation, usually one system and one user message
    pub messages: Vec<Message>,

    /// Output budget in tokens
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f64,
}

impl CompletionRequest {
    /// Build a request from a system prompt and a user prompt
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system), Message::user(user)],
            max_tokens: 4096,
            temperature: 0.7,
        }
    }

    /// Override the sampling temperature
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Override the output token budget
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Stable fingerprint of the request, used as a cache key
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for message in &self.messages {
            hasher.update(message.role.to_string().as_bytes());
            hasher.update([0u8]);
            hasher.update(message.content.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Completed provider response
#[derive(Debug, Clone)]
pub struct Completion {
    /// Raw text content of the response
    pub content: String,

    /// Total tokens the API reported, 0 when unknown
    pub token_usage: i64,
}

/// Completion provider trait all providers must implement
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Returns the name of the provider (e.g., "openai", "anthropic")
    fn name(&self) -> &str;

    /// Run one completion request
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Check if the provider is currently healthy and available.
    /// Default implementation returns true.
    async fn check_health(&self) -> bool {
        true
    }
}

/// Pull the first JSON value out of free-form model output.
///
/// Handles the formats models actually produce:
/// 1. The whole response is valid JSON
/// 2. JSON inside a markdown code fence, with or without trailing prose
/// 3. A JSON object or array embedded mid-prose
pub fn extract_json_value(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();

    // Pattern 1: entire content parses
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }

    // Pattern 2: fenced block body
    if let Some(inner) = extract_fenced_block(trimmed) {
        if let Ok(v) = serde_json::from_str(inner.trim()) {
            return Some(v);
        }
    }

    // Pattern 3: earliest embedded object or array that balances
    let mut starts: Vec<usize> = Vec::new();
    if let Some(p) = trimmed.find('{') {
        starts.push(p);
    }
    if let Some(p) = trimmed.find('[') {
        starts.push(p);
    }
    starts.sort_unstable();

    for pos in starts {
        if let Some(candidate) = extract_balanced(&trimmed[pos..]) {
            if let Ok(v) = serde_json::from_str(candidate) {
                return Some(v);
            }
        }
    }

    None
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
/// Returns `None` if no fenced block is found.
fn extract_fenced_block(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract a balanced JSON object or array starting at position 0 of `s`.
///
/// Counts bracket depth, respecting string literals and escapes, to find
/// the matching close.
fn extract_balanced(s: &str) -> Option<&str> {
    let (open, close) = match s.chars().next()? {
        '{' => ('{', '}'),
        '[' => ('[', ']'),
        _ => return None,
    };

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }

    None
}
