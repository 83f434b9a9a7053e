//! LLM Client (C2): stateless `complete(template, variables) -> rawText`
//! call with retry, timeout, and response sanitization.
//!
//! Grounded on the `InferenceProvider` trait and HTTP-backed provider
//! implementation elsewhere in this codebase's inference module, narrowed
//! from a multi-provider routing registry down to a single-provider
//! contract.

/// Prompt-as-data template registry.
pub mod templates;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

pub use templates::TemplateStore;

/// Errors surfaced by the LLM Client.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// A retryable failure (network, rate limit, server error).
    #[error("transient failure: {0}")]
    Transient(String),
    /// The provider's output could not be parsed or rendered.
    #[error("invalid output: {0}")]
    InvalidOutput(String),
    /// The provider rejected the credential.
    #[error("auth failure: {0}")]
    Auth(String),
    /// The call exceeded its deadline.
    #[error("timed out")]
    Timeout,
}

/// A raw call result from a provider, before sanitization.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// The provider's raw text output.
    pub text: String,
}

/// The seam an HTTP-backed LLM provider implements. Stateless; safe for
/// concurrent use.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send `prompt` to the provider and return its raw, unsanitized output.
    async fn complete_raw(&self, prompt: &str) -> Result<ProviderResponse, LlmError>;
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

/// Ollama-compatible HTTP provider, matching the request/response shape
/// already used for local-model inference in this codebase.
pub struct OllamaHttpProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaHttpProvider {
    /// Build a provider targeting a local or remote Ollama `base_url`.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaHttpProvider {
    #[instrument(skip(self, prompt), fields(provider = "ollama"))]
    async fn complete_raw(&self, prompt: &str) -> Result<ProviderResponse, LlmError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(LlmError::Auth(format!("provider returned {status}")));
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::Transient(format!("provider returned {status}")));
        }
        if !status.is_success() {
            return Err(LlmError::InvalidOutput(format!(
                "provider returned {status}"
            )));
        }

        let parsed: OllamaResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidOutput(e.to_string()))?;
        Ok(ProviderResponse {
            text: parsed.response,
        })
    }
}

/// The LLM Client: loads named templates, renders variables, calls the
/// provider with retry/backoff under a deadline, and sanitizes the result.
pub struct LlmClient {
    provider: Box<dyn LlmProvider>,
    templates: TemplateStore,
    per_call_timeout: Duration,
    max_elapsed: Duration,
}

impl LlmClient {
    /// Build a client over `provider`, rendering from `templates` and
    /// bounding each call and the overall retry budget by `deadline`.
    pub fn new(provider: Box<dyn LlmProvider>, templates: TemplateStore, deadline: Duration) -> Self {
        Self {
            provider,
            templates,
            per_call_timeout: deadline,
            max_elapsed: deadline,
        }
    }

    /// `complete(promptTemplate, variables) -> rawText`.
    #[instrument(skip(self, variables), fields(template = template_name))]
    pub async fn complete(
        &self,
        template_name: &str,
        variables: &HashMap<&str, String>,
    ) -> Result<String, LlmError> {
        let prompt = self
            .templates
            .render(template_name, variables)
            .map_err(|e| LlmError::InvalidOutput(e.to_string()))?;

        let raw = self.call_with_retry(&prompt).await?;
        Ok(sanitize(&raw.text))
    }

    async fn call_with_retry(&self, prompt: &str) -> Result<ProviderResponse, LlmError> {
        let mut backoff = Duration::from_millis(200);
        let start = tokio::time::Instant::now();

        loop {
            let attempt = tokio::time::timeout(self.per_call_timeout, self.provider.complete_raw(prompt))
                .await
                .map_err(|_| LlmError::Timeout)?;

            match attempt {
                Ok(resp) => return Ok(resp),
                Err(LlmError::Transient(msg)) => {
                    if start.elapsed() + backoff >= self.max_elapsed {
                        return Err(LlmError::Transient(msg));
                    }
                    warn!(error = %msg, backoff_ms = backoff.as_millis(), "retrying transient LLM failure");
                    let jitter_ms = rand::thread_rng().gen_range(0..50);
                    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(other) => return Err(other),
            }
        }
    }
}

/// Strip `<think>...</think>` spans, then try a direct JSON parse, then fall
/// back to the first fenced code block, else return the trimmed text
/// unchanged.
pub fn sanitize(raw: &str) -> String {
    let stripped = strip_think_tags(raw);
    let trimmed = stripped.trim();

    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return trimmed.to_string();
    }

    if let Some(block) = extract_fenced_block(trimmed) {
        return block;
    }

    trimmed.to_string()
}

fn strip_think_tags(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("<think>") {
        result.push_str(&rest[..open]);
        match rest[open..].find("</think>") {
            Some(close_rel) => {
                let close = open + close_rel + "</think>".len();
                rest = &rest[close..];
            }
            None => {
                rest = "";
                break;
            }
        }
    }
    result.push_str(rest);
    result
}

fn extract_fenced_block(text: &str) -> Option<String> {
    let fence_start = text.find("```")?;
    let after_fence = &text[fence_start + 3..];
    let body_start = after_fence
        .find('\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    let body = &after_fence[body_start..];
    let fence_end = body.find("```")?;
    Some(body[..fence_end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_passes_through_raw_json() {
        assert_eq!(sanitize(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn sanitize_strips_think_tags() {
        let raw = "<think>reasoning here</think>{\"a\": 1}";
        assert_eq!(sanitize(raw), r#"{"a": 1}"#);
    }

    #[test]
    fn sanitize_extracts_fenced_json_block() {
        let raw = "Sure, here you go:\n```json\n{\"a\": 1}\n```\nhope that helps";
        assert_eq!(sanitize(raw), r#"{"a": 1}"#);
    }

    #[test]
    fn sanitize_returns_unchanged_text_when_not_json_and_not_fenced() {
        assert_eq!(sanitize("  just plain prose  "), "just plain prose");
    }

    struct CountingProvider {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for CountingProvider {
        async fn complete_raw(&self, _prompt: &str) -> Result<ProviderResponse, LlmError> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                Err(LlmError::Transient("flaky".to_string()))
            } else {
                Ok(ProviderResponse {
                    text: r#"{"ok": true}"#.to_string(),
                })
            }
        }
    }

    #[tokio::test]
    async fn retries_once_on_transient_then_succeeds() {
        let provider = CountingProvider {
            calls: std::sync::atomic::AtomicUsize::new(0),
        };
        let mut templates = HashMap::new();
        templates.insert("t".to_string(), "hello {{name}}".to_string());
        let client = LlmClient::new(
            Box::new(provider),
            TemplateStore::from_map(templates),
            Duration::from_secs(5),
        );

        let mut vars = HashMap::new();
        vars.insert("name", "world".to_string());
        let out = client.complete("t", &vars).await.unwrap();
        assert_eq!(out, r#"{"ok": true}"#);
    }
}
