//! Adapter for the Anthropic Messages API.
//!
//! Structured mode declares a single tool whose `input_schema` is the output
//! schema and forces the model to call it; the tool call's input is the
//! result. Free-text mode sends the prompt as-is and runs the strict parser
//! over the text blocks of the reply.

use super::http::{classify_status, classify_transport, parse_retry_after};
use crate::models::{GenerationError, PairgenError, ProviderConfig, Result};
use crate::provider::{Message, OutputSchema, ProviderAdapter, StructuredResult, parse_object, parse_reply};
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

const API_VERSION: &str = "2023-06-01";

/// Name of the tool the model is forced to call in structured mode.
pub const RECORD_TOOL: &str = "record_output";

/// Tool declaration; the input schema is the output schema.
#[derive(Debug, Serialize)]
struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { name: String, input: Value },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Provider adapter speaking `POST {base_url}/messages`.
pub struct MessagesAdapter {
    client: reqwest::Client,
    id: String,
    model: String,
    base_url: String,
    api_key: Option<String>,
    temperature: f64,
    max_tokens: u32,
    structured: bool,
}

impl MessagesAdapter {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
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
            let value = HeaderValue::from_str(api_key).map_err(|_| {
                GenerationError::unavailable("API key is not a valid header value").permanent()
            })?;
            headers.insert("x-api-key", value);
        }
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn request_body(&self, rendered_prompt: &str, schema: &OutputSchema) -> MessagesRequest<'_> {
        let (tools, tool_choice) = if self.structured {
            (
                vec![ToolDefinition {
                    name: RECORD_TOOL,
                    description: "Record the generated output fields.",
                    input_schema: schema.json_schema(),
                }],
                Some(serde_json::json!({ "type": "tool", "name": RECORD_TOOL })),
            )
        } else {
            (Vec::new(), None)
        };

        MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: vec![Message::user(rendered_prompt)],
            tools,
            tool_choice,
        }
    }
}

/// Turn the reply's content blocks into a result.
///
/// A call to the record tool wins; otherwise the text blocks are parsed.
fn extract_result(
    blocks: Vec<ContentBlock>,
    schema: &OutputSchema,
) -> std::result::Result<StructuredResult, GenerationError> {
    let mut text = String::new();
    for block in blocks {
        match block {
            ContentBlock::ToolUse { name, input } if name == RECORD_TOOL => {
                let object: Map<String, Value> = match input {
                    Value::Object(map) => map,
                    other => {
                        return Err(GenerationError::malformed(format!(
                            "tool input is not an object: {other}"
                        )));
                    }
                };
                return parse_object(&object, schema);
            }
            ContentBlock::Text { text: t } => text.push_str(&t),
            _ => {}
        }
    }

    if text.trim().is_empty() {
        return Err(GenerationError::malformed("no tool call or text in response"));
    }
    parse_reply(&text, schema)
}

#[async_trait]
impl ProviderAdapter for MessagesAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        rendered_prompt: &str,
        schema: &OutputSchema,
    ) -> std::result::Result<StructuredResult, GenerationError> {
        let url = format!("{}/messages", self.base_url);
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

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::malformed(format!("unreadable response body: {e}")))?;

        debug!(
            provider = %self.id,
            structured = self.structured,
            blocks = body.content.len(),
            "Message received"
        );

        let result = extract_result(body.content, schema)?;
        Ok(result.with_model(body.model.unwrap_or_else(|| self.model.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GenerationErrorKind, ProviderKind};
    use reqwest::StatusCode;

    fn config(structured: bool) -> ProviderConfig {
        ProviderConfig {
            id: "claude".to_string(),
            kind: ProviderKind::AnthropicMessages,
            base_url: "https://api.anthropic.com/v1/".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            api_key: Some("sk-test".to_string()),
            api_key_env: None,
            concurrency: 1,
            max_retries: 0,
            retry_delay_ms: 0,
            timeout_secs: 5,
            structured,
            temperature: 1.0,
            max_tokens: 512,
        }
    }

    fn blocks(value: Value) -> Vec<ContentBlock> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_structured_request_forces_the_tool() {
        let adapter = MessagesAdapter::from_config(&config(true)).unwrap();
        assert_eq!(adapter.base_url, "https://api.anthropic.com/v1");

        let body = serde_json::to_value(adapter.request_body("hi", &OutputSchema::pair_variants())).unwrap();
        assert_eq!(body["tools"][0]["name"], RECORD_TOOL);
        assert_eq!(
            body["tools"][0]["input_schema"]["required"],
            serde_json::json!(["instruction", "response", "response_variant_2"])
        );
        assert_eq!(body["tool_choice"]["type"], "tool");
        assert_eq!(body["tool_choice"]["name"], RECORD_TOOL);

        let headers = adapter.headers().unwrap();
        assert_eq!(headers["x-api-key"], "sk-test");
        assert_eq!(headers["anthropic-version"], API_VERSION);
    }

    #[test]
    fn test_free_text_request_has_no_tools() {
        let adapter = MessagesAdapter::from_config(&config(false)).unwrap();
        let body = serde_json::to_value(adapter.request_body("hi", &OutputSchema::default())).unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_tool_call_input_is_the_result() {
        let content = blocks(serde_json::json!([
            { "type": "text", "text": "Here you go." },
            {
                "type": "tool_use",
                "id": "toolu_1",
                "name": RECORD_TOOL,
                "input": { "instruction": "Ceist", "response": "Freagra" }
            }
        ]));
        let result = extract_result(content, &OutputSchema::default()).unwrap();
        assert_eq!(result.get("response"), Some("Freagra"));
    }

    #[test]
    fn test_text_reply_goes_through_the_parser() {
        let content = blocks(serde_json::json!([
            { "type": "thinking", "thinking": "..." },
            { "type": "text", "text": "<instruction>Ceist</instruction>\n<response>Freagra</response>" }
        ]));
        let result = extract_result(content, &OutputSchema::default()).unwrap();
        assert_eq!(result.get("instruction"), Some("Ceist"));

        let err = extract_result(Vec::new(), &OutputSchema::default()).unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::MalformedOutput);
    }

    #[test]
    fn test_overloaded_is_transient() {
        let status = StatusCode::from_u16(529).unwrap();
        assert!(classify_status(status, None, "Overloaded").is_transient());
    }
}
