//! Anthropic Messages API backend.

use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::error::{LlmError, Result};
use crate::http::{ErrorHint, HttpBackend, status_error};
use crate::provider::ProviderKind;
use crate::streaming::{AnthropicStreamReducer, json_string, json_u32};
use crate::types::{ChatRequest, ContentBlock, Message, Response, Role, StopReason, Tool, ToolCall, Usage};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default Anthropic API base URL.
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// Default model.
pub const ANTHROPIC_DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic beta header required for OAuth token authentication.
const ANTHROPIC_OAUTH_BETA: &str = "oauth-2025-04-20";

const MODELS: &[&str] = &[
    "claude-opus-4-20250514",
    "claude-sonnet-4-20250514",
    "claude-3-7-sonnet-20250219",
    "claude-3-5-haiku-20241022",
];

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// The Anthropic Messages API.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicBackend;

impl HttpBackend for AnthropicBackend {
    type Reducer = AnthropicStreamReducer;

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn display_name(&self) -> &'static str {
        "Anthropic"
    }

    fn models(&self) -> Vec<String> {
        MODELS.iter().map(|m| (*m).to_owned()).collect()
    }

    fn endpoint_url(&self, base_url: &str) -> String {
        format!("{}/v1/messages", base_url.trim_end_matches('/'))
    }

    fn build_request(
        &self,
        request: &ChatRequest,
        model: &str,
        max_tokens: u32,
        stream: bool,
    ) -> Value {
        let (system_text, messages) =
            messages_to_anthropic(request.system_prompt.as_deref(), &request.messages);

        let mut body = json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": messages,
        });

        if let Some(system) = system_text {
            body["system"] = json!(system);
        }

        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }

        if !request.tools.is_empty() {
            body["tools"] = tools_to_anthropic(&request.tools);
        }

        if stream {
            body["stream"] = json!(true);
        }

        body
    }

    fn parse_response(&self, body: &Value) -> Result<Response> {
        parse_anthropic_response(body)
    }

    /// Supports both standard API keys (`x-api-key` header) and OAuth tokens
    /// (`Authorization: Bearer` header).  OAuth tokens are detected by their
    /// `sk-ant-oat` prefix.
    fn add_auth(&self, headers: &mut HeaderMap, api_key: &str) -> Result<()> {
        if api_key.starts_with("sk-ant-oat") {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|e| {
                    LlmError::InvalidRequest {
                        reason: format!("invalid authorization header: {e}"),
                    }
                })?,
            );
            headers.insert(
                "anthropic-beta",
                HeaderValue::from_static(ANTHROPIC_OAUTH_BETA),
            );
        } else {
            headers.insert(
                "x-api-key",
                HeaderValue::from_str(api_key).map_err(|e| LlmError::InvalidRequest {
                    reason: format!("invalid API key header: {e}"),
                })?,
            );
        }

        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        Ok(())
    }

    fn parse_error(&self, status: StatusCode, body: &str) -> Option<LlmError> {
        let v: Value = serde_json::from_str(body).ok()?;
        v.get("error")?;
        Some(error_from_body(Some(status.as_u16()), &v))
    }

    fn stream_reducer(&self) -> AnthropicStreamReducer {
        AnthropicStreamReducer::new()
    }
}

/// Classify an Anthropic error document
/// (`{"type":"error","error":{"type":...,"message":...}}`).
///
/// Used for non-2xx bodies and for `error` events inside a stream.
pub(crate) fn error_from_body(status: Option<u16>, v: &Value) -> LlmError {
    let err = &v["error"];
    let message = err["message"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| v.to_string());

    let hint = match err["type"].as_str() {
        Some("authentication_error" | "permission_error") => ErrorHint::Auth,
        Some("rate_limit_error") => ErrorHint::RateLimit,
        Some("api_error" | "overloaded_error") => ErrorHint::Server,
        _ => ErrorHint::Unknown,
    };
    status_error("anthropic", status, hint, message)
}

// ===========================================================================
// Format conversion
// ===========================================================================

/// Split system text out (Anthropic expects it as a top-level field, not in
/// the `messages` array) and convert the remaining messages to the wire
/// format.
///
/// Tool results become `user` turns; consecutive results are merged into one
/// turn so the conversation keeps alternating roles.
pub fn messages_to_anthropic(
    system_prompt: Option<&str>,
    messages: &[Message],
) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = system_prompt
        .filter(|s| !s.is_empty())
        .map(String::from);
    let mut wire_messages: Vec<Value> = Vec::with_capacity(messages.len());
    let mut last_was_tool = false;

    for msg in messages {
        match msg.role {
            Role::System => {
                let text = msg.text();
                match &mut system {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(&text);
                    }
                    None => system = Some(text),
                }
                continue;
            }
            Role::User | Role::Assistant => {
                let role = if msg.role == Role::User { "user" } else { "assistant" };
                wire_messages.push(json!({
                    "role": role,
                    "content": content_to_anthropic(&msg.content),
                }));
                last_was_tool = false;
            }
            Role::Tool => {
                let blocks: Vec<Value> = msg.content.iter().map(block_to_anthropic).collect();
                if last_was_tool
                    && let Some(Value::Array(existing)) = wire_messages
                        .last_mut()
                        .and_then(|m| m.get_mut("content"))
                {
                    existing.extend(blocks);
                } else {
                    wire_messages.push(json!({
                        "role": "user",
                        "content": blocks,
                    }));
                }
                last_was_tool = true;
            }
        }
    }

    (system, wire_messages)
}

/// A lone text block is sent as a plain string; anything else as an array.
fn content_to_anthropic(blocks: &[ContentBlock]) -> Value {
    match blocks {
        [ContentBlock::Text { text }] => json!(text),
        _ => Value::Array(blocks.iter().map(block_to_anthropic).collect()),
    }
}

fn block_to_anthropic(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({
            "type": "text",
            "text": text,
        }),
        ContentBlock::ToolUse(call) => json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let mut v = json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            });
            if *is_error {
                v["is_error"] = json!(true);
            }
            v
        }
        ContentBlock::Image { media_type, data } => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": media_type,
                "data": data,
            },
        }),
    }
}

/// Convert tool definitions into the Anthropic API format.
pub fn tools_to_anthropic(tools: &[Tool]) -> Value {
    let tool_values: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema(),
            })
        })
        .collect();
    json!(tool_values)
}

/// Parse a non-streaming Anthropic Messages API response.
pub fn parse_anthropic_response(v: &Value) -> Result<Response> {
    let content = v["content"]
        .as_array()
        .ok_or_else(|| LlmError::invalid_response("missing `content` array in response"))?;

    let mut response = Response::new(json_string(v, "id"), json_string(v, "model"));

    for block in content {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(t) = block["text"].as_str() {
                    response.content.push(ContentBlock::text(t));
                }
            }
            Some("tool_use") => {
                response.content.push(ContentBlock::ToolUse(ToolCall {
                    id: json_string(block, "id"),
                    name: json_string(block, "name"),
                    input: match &block["input"] {
                        Value::Null => json!({}),
                        other => other.clone(),
                    },
                }));
            }
            other => tracing::trace!(block_type = ?other, "ignoring content block"),
        }
    }

    if let Some(reason) = v["stop_reason"].as_str() {
        response.stop_reason = StopReason::from_anthropic(reason);
    }

    let usage = &v["usage"];
    if usage.is_object() {
        response.usage = Some(Usage {
            input_tokens: json_u32(usage, "input_tokens").unwrap_or(0),
            output_tokens: json_u32(usage, "output_tokens").unwrap_or(0),
        });
    }

    Ok(response)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::ToolParameter;

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest::new(messages)
    }

    #[test]
    fn build_request_body_basic() {
        let req = ChatRequest {
            temperature: Some(0.7),
            ..request(vec![Message::system("You are helpful."), Message::user("Hello")])
        };

        let body = AnthropicBackend.build_request(&req, "claude-sonnet-4-20250514", 1024, false);

        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert_eq!(body["system"], "You are helpful.");
        assert_eq!(body["max_tokens"], 1024);
        let temp = body["temperature"].as_f64().unwrap();
        assert!((temp - 0.7).abs() < 1e-6, "temperature was {temp}");
        assert!(body.get("stream").is_none());

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "Hello");
    }

    #[test]
    fn system_prompt_and_system_messages_combine() {
        let req = request(vec![Message::system("Be brief."), Message::user("Hi")])
            .with_system_prompt("You are helpful.");
        let body = AnthropicBackend.build_request(&req, "m", 10, false);
        assert_eq!(body["system"], "You are helpful.\nBe brief.");
    }

    #[test]
    fn build_request_body_with_tools() {
        let req = request(vec![Message::user("Read file.txt")]).with_tools(vec![
            Tool::new("read_file", "Read a file")
                .with_parameter(ToolParameter::required("path", "string", "File path")),
        ]);

        let body = AnthropicBackend.build_request(&req, "m", 10, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["tools"][0]["name"], "read_file");
        assert_eq!(body["tools"][0]["input_schema"]["required"][0], "path");
    }

    #[test]
    fn tool_results_pair_with_tool_use_and_merge() {
        let req = request(vec![
            Message::user("Read a and b"),
            Message::assistant_blocks(vec![
                ContentBlock::text("Reading both."),
                ContentBlock::tool_use("tc_01", "read_file", json!({"path": "a"})),
                ContentBlock::tool_use("tc_02", "read_file", json!({"path": "b"})),
            ]),
            Message::tool_result("tc_01", "contents a", false),
            Message::tool_result("tc_02", "no such file", true),
        ]);

        let body = AnthropicBackend.build_request(&req, "m", 10, false);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);

        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"][0]["type"], "text");
        assert_eq!(messages[1]["content"][1]["type"], "tool_use");
        assert_eq!(messages[1]["content"][1]["id"], "tc_01");

        assert_eq!(messages[2]["role"], "user");
        let results = messages[2]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_use_id"], "tc_01");
        assert!(results[0].get("is_error").is_none());
        assert_eq!(results[1]["tool_use_id"], "tc_02");
        assert_eq!(results[1]["is_error"], true);
    }

    #[test]
    fn image_blocks_use_base64_source() {
        let req = request(vec![Message::new(
            Role::User,
            vec![
                ContentBlock::text("What is this?"),
                ContentBlock::Image {
                    media_type: "image/png".into(),
                    data: "iVBORw0KGgo=".into(),
                },
            ],
        )]);
        let body = AnthropicBackend.build_request(&req, "m", 10, false);
        let image = &body["messages"][0]["content"][1];
        assert_eq!(image["type"], "image");
        assert_eq!(image["source"]["media_type"], "image/png");
    }

    #[test]
    fn oauth_tokens_use_bearer_auth() {
        let mut headers = HeaderMap::new();
        AnthropicBackend
            .add_auth(&mut headers, "sk-ant-oat01-abc")
            .unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer sk-ant-oat01-abc");
        assert_eq!(headers["anthropic-beta"], ANTHROPIC_OAUTH_BETA);
        assert!(headers.get("x-api-key").is_none());

        let mut headers = HeaderMap::new();
        AnthropicBackend.add_auth(&mut headers, "sk-ant-api03-abc").unwrap();
        assert_eq!(headers["x-api-key"], "sk-ant-api03-abc");
        assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);
    }

    #[test]
    fn parse_text_response() {
        let v = json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-20250514",
            "content": [{"type": "text", "text": "Hello, world!"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        });

        let resp = parse_anthropic_response(&v).unwrap();
        assert_eq!(resp.id, "msg_01");
        assert_eq!(resp.text(), "Hello, world!");
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert_eq!(
            resp.usage,
            Some(Usage {
                input_tokens: 10,
                output_tokens: 5
            })
        );
    }

    #[test]
    fn parse_tool_use_response() {
        let v = json!({
            "id": "msg_01",
            "content": [
                {"type": "text", "text": "check weather"},
                {"type": "tool_use", "id": "toolu_01", "name": "get_weather", "input": {"location": "SF"}}
            ],
            "stop_reason": "tool_use"
        });

        let resp = parse_anthropic_response(&v).unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.content.len(), 2);
        let calls = resp.tool_calls();
        assert_eq!(calls[0].id, "toolu_01");
        assert_eq!(calls[0].input["location"], "SF");
    }

    #[test]
    fn missing_content_is_invalid_response() {
        let err = parse_anthropic_response(&json!({"id": "x"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    }

    #[test]
    fn error_bodies_are_classified() {
        let backend = AnthropicBackend;
        let auth = r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#;
        let err = backend.parse_error(StatusCode::UNAUTHORIZED, auth).unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
        assert!(err.to_string().contains("invalid x-api-key"));

        let limited = r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow"}}"#;
        let err = backend.parse_error(StatusCode::TOO_MANY_REQUESTS, limited).unwrap();
        assert_eq!(err.kind(), ErrorKind::RateLimited);

        let overloaded = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let err = backend.parse_error(StatusCode::from_u16(529).unwrap(), overloaded).unwrap();
        assert_eq!(err.kind(), ErrorKind::Network);

        assert!(backend.parse_error(StatusCode::BAD_GATEWAY, "<html>").is_none());
    }
}
