//! Gemini CLI backend.
//!
//! Both blocking and streaming runs use `--output-format stream-json`,
//! which emits `init`, `message`, `tool_use`, `tool_result` and `result`
//! events.  The plain `json` format reports only the final text, so tool
//! use would be invisible to blocking callers.

use serde_json::Value;

use crate::cli::{CliBackend, CliStreamState};
use crate::error::{LlmError, Result};
use crate::provider::ProviderKind;
use crate::streaming::{json_string, json_u32};
use crate::types::{ChatRequest, ContentBlock, ToolCall, Usage};

pub const GEMINI_CLI_DEFAULT_MODEL: &str = "gemini-2.5-pro";

const MODELS: &[&str] = &["gemini-2.5-pro", "gemini-2.5-flash", "gemini-2.5-flash-lite"];

#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiCliBackend;

impl CliBackend for GeminiCliBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GeminiCli
    }

    fn display_name(&self) -> &'static str {
        "Gemini CLI"
    }

    fn models(&self) -> Vec<String> {
        MODELS.iter().map(|m| (*m).to_owned()).collect()
    }

    fn executable_name(&self) -> &'static str {
        "gemini"
    }

    fn executable_env_var(&self) -> &'static str {
        "GEMINI_CLI_PATH"
    }

    fn build_args(
        &self,
        _request: &ChatRequest,
        model: &str,
        _streaming: bool,
        resume_session: Option<&str>,
    ) -> Vec<String> {
        let mut args = vec![
            "--model".to_owned(),
            model.to_owned(),
            "--output-format".to_owned(),
            "stream-json".to_owned(),
        ];
        if let Some(session) = resume_session {
            args.push("--resume".into());
            args.push(session.to_owned());
        }
        args
    }

    fn parse_stream_line(&self, line: &str, state: &mut CliStreamState) -> Result<Option<String>> {
        let v: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping non-JSON gemini output line");
                return Ok(None);
            }
        };

        match v["type"].as_str().unwrap_or_default() {
            "init" => {
                if let Some(id) = v["session_id"].as_str() {
                    state.session_id = Some(id.to_owned());
                }
                if let Some(model) = v["model"].as_str() {
                    state.response.model = model.to_owned();
                }
                Ok(None)
            }
            "message" if v["role"] == "assistant" => {
                let text = v["content"].as_str().unwrap_or_default();
                if text.is_empty() {
                    return Ok(None);
                }
                state.response.push_text(text);
                Ok(Some(text.to_owned()))
            }
            "tool_use" => {
                state.response.content.push(ContentBlock::ToolUse(ToolCall {
                    id: json_string(&v, "tool_id"),
                    name: json_string(&v, "tool_name"),
                    input: v
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Default::default())),
                }));
                Ok(None)
            }
            "error" => Err(gemini_error(&v)),
            "result" => {
                state.done = true;
                if v["status"] == "error" {
                    return Err(gemini_error(&v["error"]));
                }
                let stats = &v["stats"];
                if stats.is_object() {
                    state.response.usage = Some(Usage {
                        input_tokens: json_u32(stats, "input_tokens").unwrap_or(0),
                        output_tokens: json_u32(stats, "output_tokens").unwrap_or(0),
                    });
                }
                Ok(None)
            }
            other => {
                tracing::trace!(event_type = other, "ignoring gemini output line");
                Ok(None)
            }
        }
    }
}

fn gemini_error(err: &Value) -> LlmError {
    let message = err["message"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| err.to_string());
    LlmError::CliExecution {
        program: "gemini".into(),
        status: err["type"].as_str().unwrap_or("error").to_owned(),
        stderr: message,
    }
}
