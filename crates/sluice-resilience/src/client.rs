//! Anthropic Messages API client
//!
//! Sends exactly one HTTP request per [`ProviderClient::send`] call and
//! classifies the outcome. Retries, breaker bookkeeping and fallback are the
//! router's job, so nothing here sleeps or keeps global state.

use crate::auth;
use crate::provider::ProviderClient;
use crate::types::{
    AnthropicMessage, AnthropicRequest, AnthropicResponse, CompletionRequest, CompletionResponse,
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use sluice_core::{ProviderConfig, ProviderError, Result};
use std::time::Duration;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Client for one configured Anthropic model
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    name: String,
    model: String,
    api_key: String,
    base_url: String,
    max_tokens: usize,
    http: reqwest::Client,
}

impl AnthropicClient {
    /// Build a client from its provider entry, reading the API key from the
    /// configured environment variable
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let api_key = auth::api_key_from_env(&config.name, &config.api_key_env)?;
        Ok(Self::new(&config.name, &config.model, api_key)
            .with_max_tokens(config.max_tokens)
            .with_base_url(
                config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| ANTHROPIC_API_URL.to_string()),
            ))
    }

    pub fn new(name: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            name: name.into(),
            model: model.into(),
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
            max_tokens: 4096,
            http,
        }
    }

    /// Set max tokens for responses
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: &CompletionRequest) -> std::result::Result<CompletionResponse, ProviderError> {
        let body = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
            system: request.system.clone(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
        };

        tracing::debug!(provider = %self.name, model = %self.model, "Sending request to Anthropic API");

        let response = self
            .http
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::unavailable(format!("Failed to send request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown".to_string());
            let mut error = classify_status(status, &error_text);
            if let Some(wait) = retry_after {
                error = error.with_retry_after(wait);
            }
            return Err(error);
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(format!("Failed to parse response: {}", e)))?;

        let text = parsed
            .content
            .iter()
            .filter(|block| block.content_type == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(ProviderError::malformed("No text content in response"));
        }

        if let Some(ref usage) = parsed.usage {
            tracing::info!(
                provider = %self.name,
                chars = text.len(),
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "Completion received"
            );
        }

        Ok(CompletionResponse {
            provider: self.name.clone(),
            model: parsed.model,
            text,
            usage: parsed.usage,
            received_at: Utc::now(),
        })
    }
}

/// Map a non-success HTTP status onto the provider error contract
///
/// 429 is a rate limit, 5xx (including Anthropic's 529 "overloaded") is
/// unavailability, any other status means the request itself was rejected.
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let message = format!("Anthropic API error {}: {}", status, body);
    let error = if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::rate_limited(message)
    } else if status.is_server_error() {
        ProviderError::unavailable(message)
    } else {
        ProviderError::malformed(message)
    };
    error.with_status(status.as_u16())
}

/// Parse the `retry-after` header if present (delta-seconds form only)
fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}
