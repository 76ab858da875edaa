//! OpenAI Chat Completions backend.
//!
//! Also drives OpenAI-compatible servers (Ollama, vLLM, Together) that accept
//! the same wire format under a different base URL.

use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::error::{LlmError, Result};
use crate::http::{ErrorHint, HttpBackend, status_error};
use crate::provider::ProviderKind;
use crate::streaming::{json_string, json_u32};
use crate::streaming_openai::OpenAiStreamReducer;
use crate::types::{ChatRequest, ContentBlock, Message, Response, Role, StopReason, Tool, ToolCall, Usage};

/// Default OpenAI API base URL.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default base URL of a local Ollama server.
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o";

pub const OLLAMA_DEFAULT_MODEL: &str = "llama3.1";

const OPENAI_MODELS: &[&str] = &["gpt-4o", "gpt-4o-mini", "gpt-4.1", "gpt-4.1-mini", "o3-mini"];

const OLLAMA_MODELS: &[&str] = &["llama3.1", "llama3.2", "qwen2.5", "mistral"];

/// An OpenAI-style Chat Completions endpoint.
#[derive(Debug, Clone, Copy)]
pub struct OpenAiBackend {
    kind: ProviderKind,
}

impl OpenAiBackend {
    /// The hosted OpenAI API.
    pub fn openai() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
        }
    }

    /// A local Ollama server.
    pub fn ollama() -> Self {
        Self {
            kind: ProviderKind::Ollama,
        }
    }
}

impl HttpBackend for OpenAiBackend {
    type Reducer = OpenAiStreamReducer;

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn display_name(&self) -> &'static str {
        match self.kind {
            ProviderKind::Ollama => "Ollama",
            _ => "OpenAI",
        }
    }

    fn models(&self) -> Vec<String> {
        let models = match self.kind {
            ProviderKind::Ollama => OLLAMA_MODELS,
            _ => OPENAI_MODELS,
        };
        models.iter().map(|m| (*m).to_owned()).collect()
    }

    fn requires_api_key(&self) -> bool {
        self.kind == ProviderKind::OpenAi
    }

    fn endpoint_url(&self, base_url: &str) -> String {
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
    }

    fn build_request(
        &self,
        request: &ChatRequest,
        model: &str,
        max_tokens: u32,
        stream: bool,
    ) -> Value {
        let messages = messages_to_openai(request.system_prompt.as_deref(), &request.messages);

        let mut body = json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": messages,
        });

        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }

        if !request.tools.is_empty() {
            body["tools"] = tools_to_openai(&request.tools);
        }

        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }

        body
    }

    fn parse_response(&self, body: &Value) -> Result<Response> {
        parse_openai_response(body)
    }

    fn add_auth(&self, headers: &mut HeaderMap, api_key: &str) -> Result<()> {
        if api_key.is_empty() {
            return Ok(());
        }
        let auth_value = format!("Bearer {api_key}");
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value).map_err(|e| LlmError::InvalidRequest {
                reason: format!("invalid authorization header: {e}"),
            })?,
        );
        Ok(())
    }

    fn parse_error(&self, status: StatusCode, body: &str) -> Option<LlmError> {
        let v: Value = serde_json::from_str(body).ok()?;
        let err = v.get("error").filter(|e| e.is_object())?;
        Some(error_from_body(Some(status.as_u16()), err))
    }

    fn stream_reducer(&self) -> OpenAiStreamReducer {
        OpenAiStreamReducer::new()
    }
}

/// Classify an OpenAI `error` object (`{"message", "type", "code"}`).
pub(crate) fn error_from_body(status: Option<u16>, err: &Value) -> LlmError {
    let message = err["message"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| err.to_string());
    let error_type = err["type"].as_str().unwrap_or_default();
    let code = err["code"].as_str().unwrap_or_default();

    let hint = match (error_type, code) {
        (_, "invalid_api_key") | ("authentication_error" | "permission_error", _) => {
            ErrorHint::Auth
        }
        (_, "rate_limit_exceeded") | ("rate_limit_exceeded" | "insufficient_quota" | "requests" | "tokens", _) => {
            ErrorHint::RateLimit
        }
        ("server_error", _) => ErrorHint::Server,
        _ => ErrorHint::Unknown,
    };
    status_error("openai", status, hint, message)
}

// ===========================================================================
// Format conversion
// ===========================================================================

/// Convert internal messages to the OpenAI Chat Completions wire format.
///
/// In the OpenAI format, system messages are part of the `messages` array
/// (with `role: "system"`), tool calls are in `assistant.tool_calls`, and
/// each tool result is its own `role: "tool"` message with a `tool_call_id`.
pub fn messages_to_openai(system_prompt: Option<&str>, messages: &[Message]) -> Vec<Value> {
    let mut wire_messages: Vec<Value> = Vec::with_capacity(messages.len() + 1);

    if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
        wire_messages.push(json!({
            "role": "system",
            "content": system,
        }));
    }

    for msg in messages {
        match msg.role {
            Role::System => {
                wire_messages.push(json!({
                    "role": "system",
                    "content": msg.text(),
                }));
            }
            Role::User => {
                wire_messages.push(json!({
                    "role": "user",
                    "content": user_content_to_openai(&msg.content),
                }));
            }
            Role::Assistant => {
                let tool_calls: Vec<Value> = msg
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse(tc) => Some(json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.input.to_string(),
                            }
                        })),
                        _ => None,
                    })
                    .collect();

                let text = msg.text();
                if tool_calls.is_empty() {
                    wire_messages.push(json!({
                        "role": "assistant",
                        "content": text,
                    }));
                } else {
                    let mut m = json!({
                        "role": "assistant",
                        "tool_calls": tool_calls,
                    });
                    if !text.is_empty() {
                        m["content"] = json!(text);
                    }
                    wire_messages.push(m);
                }
            }
            Role::Tool => {
                for block in &msg.content {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } = block
                    {
                        wire_messages.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": content,
                        }));
                    }
                }
            }
        }
    }

    wire_messages
}

/// Plain text stays a string; mixed text and images become content parts.
fn user_content_to_openai(blocks: &[ContentBlock]) -> Value {
    let has_image = blocks
        .iter()
        .any(|b| matches!(b, ContentBlock::Image { .. }));
    if !has_image {
        let text: String = blocks.iter().filter_map(ContentBlock::as_text).collect();
        return json!(text);
    }

    let parts: Vec<Value> = blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(json!({"type": "text", "text": text})),
            ContentBlock::Image { media_type, data } => Some(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{media_type};base64,{data}")},
            })),
            _ => None,
        })
        .collect();
    json!(parts)
}

/// Convert tool definitions into the OpenAI Chat Completions API format.
///
/// OpenAI wraps each tool in `{"type": "function", "function": {...}}`.
pub fn tools_to_openai(tools: &[Tool]) -> Value {
    let tool_values: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema(),
                }
            })
        })
        .collect();
    json!(tool_values)
}

/// Parse a non-streaming OpenAI Chat Completions response.
pub fn parse_openai_response(v: &Value) -> Result<Response> {
    let choice = &v["choices"][0];
    let message = &choice["message"];

    if message.is_null() {
        return Err(LlmError::invalid_response(
            "missing `choices[0].message` in response",
        ));
    }

    let mut response = Response::new(json_string(v, "id"), json_string(v, "model"));

    if let Some(content) = message["content"].as_str().filter(|c| !c.is_empty()) {
        response.content.push(ContentBlock::text(content));
    }

    if let Some(tool_calls_arr) = message["tool_calls"].as_array() {
        for tc in tool_calls_arr {
            let func = &tc["function"];
            let name = json_string(func, "name");
            let args_str = func["arguments"].as_str().unwrap_or("{}");
            let input: Value = if args_str.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(args_str).map_err(|e| {
                    LlmError::invalid_response(format!(
                        "invalid JSON in OpenAI tool call `{name}` arguments: {e}"
                    ))
                })?
            };
            response.content.push(ContentBlock::ToolUse(ToolCall {
                id: json_string(tc, "id"),
                name,
                input,
            }));
        }
    }

    if let Some(reason) = choice["finish_reason"].as_str() {
        response.stop_reason = StopReason::from_openai(reason);
    }

    let usage = &v["usage"];
    if usage.is_object() {
        response.usage = Some(Usage {
            input_tokens: json_u32(usage, "prompt_tokens").unwrap_or(0),
            output_tokens: json_u32(usage, "completion_tokens").unwrap_or(0),
        });
    }

    Ok(response)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
