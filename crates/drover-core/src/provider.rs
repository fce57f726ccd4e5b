//! Chat-completion provider client (the primary execution path).
//!
//! [`ChatApi`] is the seam the execution adapter calls through; production
//! uses [`OpenRouterClient`], tests substitute a scripted stub.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

/// Token usage reported by a provider. Either naming convention
/// (`prompt/completion` or `input/output`) is accepted on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Extract usage from a provider `usage` object, tolerating both field
    /// namings and computing the total when absent.
    pub fn from_json(usage: &Value) -> Self {
        let read = |keys: [&str; 2]| {
            keys.iter()
                .filter_map(|k| usage.get(*k).and_then(Value::as_u64))
                .find(|v| *v > 0)
                .unwrap_or(0)
        };
        let prompt_tokens = read(["prompt_tokens", "input_tokens"]);
        let completion_tokens = read(["completion_tokens", "output_tokens"]);
        let total_tokens = usage
            .get("total_tokens")
            .and_then(Value::as_u64)
            .filter(|v| *v > 0)
            .unwrap_or(prompt_tokens + completion_tokens);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }

    pub fn to_json(self) -> Value {
        json!({
            "prompt_tokens": self.prompt_tokens,
            "completion_tokens": self.completion_tokens,
            "total_tokens": self.total_tokens,
        })
    }
}

/// A successful chat completion.
#[derive(Debug, Clone, Default)]
pub struct ChatCompletion {
    pub content: String,
    pub usage: TokenUsage,
    pub provider_request_id: String,
    pub response_id: String,
}

/// Typed provider failures. `Unconfigured` is the one the controller watches
/// for: it is the trigger for the Codex subprocess fallback.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("OPENROUTER_API_KEY is not configured")]
    Unconfigured,
    #[error("provider request timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider rate limited: {0}")]
    RateLimited(String),
    #[error("provider returned a malformed response: {0}")]
    MalformedResponse(String),
    #[error("provider request failed: {0}")]
    Http(String),
}

impl ProviderError {
    /// Whether this error means the OpenRouter key is missing (the codex
    /// fallback condition).
    pub fn is_unconfigured(&self) -> bool {
        matches!(self, Self::Unconfigured)
    }
}

/// Adapter interface for the primary provider.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn chat_completion(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<ChatCompletion, ProviderError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn ChatApi) {}
};

// ---------------------------------------------------------------------------
// OpenRouter client
// ---------------------------------------------------------------------------

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP chat-completion client against an OpenRouter-style API.
pub struct OpenRouterClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenRouterClient {
    /// Build from the environment: `OPENROUTER_API_KEY`, optional
    /// `OPENROUTER_BASE_URL`.
    pub fn from_env() -> Self {
        let base_url = std::env::var("OPENROUTER_BASE_URL")
            .ok()
            .map(|s| s.trim().trim_end_matches('/').to_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .ok()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty());
        Self::new(base_url, api_key)
    }

    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            api_key,
        }
    }

    fn extract_error(value: &Value) -> Option<String> {
        let error = value.get("error")?;
        error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| Some(error.to_string()))
    }
}

#[async_trait]
impl ChatApi for OpenRouterClient {
    async fn chat_completion(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<ChatCompletion, ProviderError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ProviderError::Unconfigured);
        };

        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ProviderError::Timeout(REQUEST_TIMEOUT)
                } else {
                    ProviderError::Http(err.to_string())
                }
            })?;

        let status = response.status();
        let provider_request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        let value: Value = response
            .json()
            .await
            .map_err(|err| ProviderError::MalformedResponse(err.to_string()))?;

        if status.as_u16() == 429 {
            let detail = Self::extract_error(&value).unwrap_or_else(|| status.to_string());
            return Err(ProviderError::RateLimited(detail));
        }
        if !status.is_success() {
            let detail = Self::extract_error(&value)
                .unwrap_or_else(|| format!("status {status}"));
            return Err(ProviderError::Http(detail));
        }
        if let Some(detail) = Self::extract_error(&value) {
            return Err(ProviderError::Http(detail));
        }

        let content = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProviderError::MalformedResponse(format!(
                    "no completion content for model `{model}`"
                ))
            })?
            .to_owned();

        let usage = value
            .get("usage")
            .map(TokenUsage::from_json)
            .unwrap_or_default();

        let response_id = value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        Ok(ChatCompletion {
            content,
            usage,
            provider_request_id,
            response_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accepts_both_namings() {
        let a = TokenUsage::from_json(&json!({"prompt_tokens": 10, "completion_tokens": 5}));
        assert_eq!(a.prompt_tokens, 10);
        assert_eq!(a.completion_tokens, 5);
        assert_eq!(a.total_tokens, 15);

        let b = TokenUsage::from_json(&json!({"input_tokens": 7, "output_tokens": 2, "total_tokens": 9}));
        assert_eq!(b.prompt_tokens, 7);
        assert_eq!(b.total_tokens, 9);
    }

    #[test]
    fn usage_total_computed_when_absent() {
        let usage = TokenUsage::from_json(&json!({"input_tokens": 3, "output_tokens": 4}));
        assert_eq!(usage.total_tokens, 7);
    }

    #[tokio::test]
    async fn missing_api_key_is_unconfigured() {
        let client = OpenRouterClient::new("http://localhost:1", None);
        let err = client
            .chat_completion("openrouter/free", "hello")
            .await
            .err()
            .expect("should fail");
        assert!(err.is_unconfigured());
        assert_eq!(err.to_string(), "OPENROUTER_API_KEY is not configured");
    }
}
