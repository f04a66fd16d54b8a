//! Adapter for OpenAI-compatible chat completions endpoints.
//!
//! Works with hosted APIs, aggregators (OpenRouter, Together, Groq) and
//! on-prem servers (vLLM, Ollama). In structured mode the request carries a
//! strict `json_schema` response format; otherwise the reply is free text and
//! goes through the strict parser. Both paths end in schema validation.

use crate::models::{GenerationError, PairgenError, ProviderConfig, Result};
use crate::provider::{OutputSchema, ProviderAdapter, StructuredResult, parse_reply};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// Message in a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Chat completion request payload.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Provider adapter speaking `POST {base_url}/chat/completions`.
pub struct ChatCompletionsAdapter {
    client: reqwest::Client,
    id: String,
    model: String,
    /// Base URL without trailing slash
    base_url: String,
    /// None for local endpoints without auth
    api_key: Option<String>,
    temperature: f64,
    max_tokens: u32,
    structured: bool,
}

impl ChatCompletionsAdapter {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;

        // The pool enforces the per-call deadline; this is a backstop for
        // connections that hang past it.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.saturating_mul(2).max(1)))
            .build()
            .map_err(PairgenError::Network)?;

        Ok(Self {
            client,
            id: config.id.clone(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            structured: config.structured,
        })
    }

    fn headers(&self) -> std::result::Result<HeaderMap, GenerationError> {
        let mut headers = HeaderMap::new();
        if let Some(ref api_key) = self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
                GenerationError::unavailable("API key is not a valid header value").permanent()
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn request_body(&self, rendered_prompt: &str, schema: &OutputSchema) -> ChatCompletionRequest<'_> {
        ChatCompletionRequest {
            model: &self.model,
            messages: vec![Message::user(rendered_prompt)],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            response_format: self.structured.then(|| response_format(schema)),
        }
    }
}

/// OpenAI-style strict `json_schema` response format.
pub fn response_format(schema: &OutputSchema) -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "generation",
            "strict": true,
            "schema": schema.json_schema(),
        }
    })
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: StatusCode, retry_after: Option<f64>, message: &str) -> GenerationError {
    let detail = format!("HTTP {}: {message}", status.as_u16());
    match status {
        StatusCode::TOO_MANY_REQUESTS => GenerationError::rate_limited(detail, retry_after),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => GenerationError::timeout(detail),
        s if s.is_server_error() => GenerationError::unavailable(detail),
        // Auth, missing model, bad request: retrying cannot help
        _ => GenerationError::unavailable(detail).permanent(),
    }
}

pub(crate) fn classify_transport(error: &reqwest::Error) -> GenerationError {
    if error.is_timeout() {
        GenerationError::timeout(error.to_string())
    } else {
        GenerationError::unavailable(error.to_string())
    }
}

pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<f64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
}

#[async_trait]
impl ProviderAdapter for ChatCompletionsAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        rendered_prompt: &str,
        schema: &OutputSchema,
    ) -> std::result::Result<StructuredResult, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(rendered_prompt, schema);

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .map(|e| e.error.message)
                .unwrap_or(error_body);
            return Err(classify_status(status, retry_after, &message));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::malformed(format!("unreadable response body: {e}")))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GenerationError::malformed("no content in response"))?;

        debug!(
            provider = %self.id,
            structured = self.structured,
            chars = content.len(),
            "Completion received"
        );

        let result = parse_reply(&content, schema)?;
        Ok(result.with_model(body.model.unwrap_or_else(|| self.model.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GenerationErrorKind, ProviderKind};

    fn config(structured: bool) -> ProviderConfig {
        ProviderConfig {
            id: "local".to_string(),
            kind: ProviderKind::OpenaiCompatible,
            base_url: "http://localhost:8000/v1/".to_string(),
            model: "qwen".to_string(),
            api_key: None,
            api_key_env: None,
            concurrency: 1,
            max_retries: 0,
            retry_delay_ms: 0,
            timeout_secs: 5,
            structured,
            temperature: 0.7,
            max_tokens: 256,
        }
    }

    #[test]
    fn test_request_body_structured() {
        let adapter = ChatCompletionsAdapter::from_config(&config(true)).unwrap();
        assert_eq!(adapter.base_url, "http://localhost:8000/v1");

        let body = serde_json::to_value(adapter.request_body("hi", &OutputSchema::default())).unwrap();
        assert_eq!(body["model"], "qwen");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
    }

    #[test]
    fn test_request_body_free_text() {
        let adapter = ChatCompletionsAdapter::from_config(&config(false)).unwrap();
        let body = serde_json::to_value(adapter.request_body("hi", &OutputSchema::default())).unwrap();
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_classify_status() {
        let e = classify_status(StatusCode::TOO_MANY_REQUESTS, Some(4.0), "slow down");
        assert_eq!(e.kind, GenerationErrorKind::RateLimited);
        assert_eq!(e.retry_after_secs, Some(4.0));
        assert!(e.is_transient());

        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT, None, "").kind,
            GenerationErrorKind::Timeout
        );

        let e = classify_status(StatusCode::BAD_GATEWAY, None, "");
        assert_eq!(e.kind, GenerationErrorKind::Unavailable);
        assert!(e.is_transient());

        let e = classify_status(StatusCode::UNAUTHORIZED, None, "bad key");
        assert!(!e.is_transient());
        assert!(e.message.contains("bad key"));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2.5"));
        assert_eq!(parse_retry_after(&headers), Some(2.5));
    }
}
