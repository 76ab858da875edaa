//! Claude Code CLI backend.
//!
//! Runs `claude -p --output-format stream-json --verbose` with the prompt on
//! stdin.  Output is NDJSON in both modes:
//!
//! ```text
//! {"type":"system","subtype":"init","session_id":"...","model":"..."}
//! {"type":"assistant","message":{"id":"msg_..","content":[...],"usage":{...}}}
//! {"type":"result","subtype":"success","is_error":false,"result":"...","usage":{...}}
//! ```
//!
//! `--max-turns 1` keeps the CLI from running its own agent loop, so
//! tool-use blocks come back to the caller.

use serde_json::Value;

use crate::cli::{CliBackend, CliStreamState};
use crate::error::{LlmError, Result};
use crate::provider::ProviderKind;
use crate::streaming::{json_string, json_u32};
use crate::types::{ChatRequest, ContentBlock, StopReason, ToolCall, Usage};

pub const CLAUDE_CLI_DEFAULT_MODEL: &str = "sonnet";

const MODELS: &[&str] = &["sonnet", "opus", "haiku"];

#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeCliBackend;

impl CliBackend for ClaudeCliBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ClaudeCli
    }

    fn display_name(&self) -> &'static str {
        "Claude Code CLI"
    }

    fn models(&self) -> Vec<String> {
        MODELS.iter().map(|m| (*m).to_owned()).collect()
    }

    fn executable_name(&self) -> &'static str {
        "claude"
    }

    fn executable_env_var(&self) -> &'static str {
        "CLAUDE_CLI_PATH"
    }

    fn build_args(
        &self,
        _request: &ChatRequest,
        model: &str,
        _streaming: bool,
        resume_session: Option<&str>,
    ) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--output-format",
            "stream-json",
            "--verbose",
            "--max-turns",
            "1",
            "--model",
        ]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();
        args.push(model.to_owned());

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
                tracing::warn!(error = %e, "skipping non-JSON claude output line");
                return Ok(None);
            }
        };

        if let Some(id) = v["session_id"].as_str().filter(|s| !s.is_empty()) {
            state.session_id = Some(id.to_owned());
        }

        match v["type"].as_str().unwrap_or_default() {
            "system" => {
                if let Some(model) = v["model"].as_str() {
                    state.response.model = model.to_owned();
                }
                Ok(None)
            }
            "assistant" => Ok(apply_assistant_message(&v["message"], state)),
            "result" => apply_result(&v, state),
            other => {
                tracing::trace!(event_type = other, "ignoring claude output line");
                Ok(None)
            }
        }
    }
}

/// Fold one complete assistant message; returns its text as the delta.
fn apply_assistant_message(message: &Value, state: &mut CliStreamState) -> Option<String> {
    let response = &mut state.response;
    if let Some(id) = message["id"].as_str() {
        response.id = id.to_owned();
    }
    if let Some(model) = message["model"].as_str() {
        response.model = model.to_owned();
    }

    let mut delta = String::new();
    for block in message["content"].as_array().into_iter().flatten() {
        match block["type"].as_str().unwrap_or_default() {
            "text" => {
                let text = block["text"].as_str().unwrap_or_default();
                response.push_text(text);
                delta.push_str(text);
            }
            "tool_use" => {
                response.content.push(ContentBlock::ToolUse(ToolCall {
                    id: json_string(block, "id"),
                    name: json_string(block, "name"),
                    input: block
                        .get("input")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Default::default())),
                }));
            }
            _ => {}
        }
    }

    if let Some(reason) = message["stop_reason"].as_str() {
        response.stop_reason = StopReason::from_anthropic(reason);
    }
    if let Some(usage) = parse_usage(&message["usage"]) {
        response.usage = Some(usage);
    }

    (!delta.is_empty()).then_some(delta)
}

fn apply_result(v: &Value, state: &mut CliStreamState) -> Result<Option<String>> {
    state.done = true;
    let subtype = v["subtype"].as_str().unwrap_or_default();
    let result_text = v["result"].as_str().unwrap_or_default();

    // Hitting the single-turn cap after a tool request is the expected
    // hand-back, not a failure.
    let max_turns_handback = subtype == "error_max_turns" && state.response.has_tool_use();
    if v["is_error"].as_bool() == Some(true) && !max_turns_handback {
        return Err(LlmError::CliExecution {
            program: "claude".into(),
            status: if subtype.is_empty() { "error".into() } else { subtype.to_owned() },
            stderr: result_text.to_owned(),
        });
    }

    if let Some(usage) = parse_usage(&v["usage"]) {
        state.response.usage = Some(usage);
    }

    // Some versions only report the answer in the result line.
    if state.response.text().is_empty() && !result_text.is_empty() {
        state.response.push_text(result_text);
        return Ok(Some(result_text.to_owned()));
    }
    Ok(None)
}

fn parse_usage(usage: &Value) -> Option<Usage> {
    if !usage.is_object() {
        return None;
    }
    Some(Usage {
        input_tokens: json_u32(usage, "input_tokens").unwrap_or(0),
        output_tokens: json_u32(usage, "output_tokens").unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::Message;

    const TEXT_RUN: &str = r#"{"type":"system","subtype":"init","session_id":"sess-1","model":"claude-sonnet-4"}
{"type":"assistant","message":{"id":"msg_1","model":"claude-sonnet-4","content":[{"type":"text","text":"4"}],"stop_reason":null,"usage":{"input_tokens":12,"output_tokens":1}},"session_id":"sess-1"}
{"type":"result","subtype":"success","is_error":false,"result":"4","session_id":"sess-1","usage":{"input_tokens":12,"output_tokens":1}}
"#;

    #[test]
    fn args_include_stream_json_and_resume() {
        let req = ChatRequest::new(vec![Message::user("hi")]);
        let args = ClaudeCliBackend.build_args(&req, "opus", true, Some("sess-9"));
        assert_eq!(&args[..4], ["-p", "--output-format", "stream-json", "--verbose"]);
        assert!(args.windows(2).any(|w| w == ["--max-turns", "1"]));
        assert!(args.windows(2).any(|w| w == ["--model", "opus"]));
        assert!(args.windows(2).any(|w| w == ["--resume", "sess-9"]));

        let args = ClaudeCliBackend.build_args(&req, "opus", false, None);
        assert!(!args.iter().any(|a| a == "--resume"));
    }

    #[test]
    fn blocking_and_streaming_agree() {
        let blocking = ClaudeCliBackend
            .parse_blocking_output(TEXT_RUN)
            .unwrap()
            .finish("sonnet")
            .unwrap();

        let mut state = CliStreamState::default();
        let mut deltas = String::new();
        for line in TEXT_RUN.lines() {
            if let Some(d) = ClaudeCliBackend.parse_stream_line(line, &mut state).unwrap() {
                deltas.push_str(&d);
            }
        }
        assert_eq!(state.session_id.as_deref(), Some("sess-1"));
        let streamed = state.finish("sonnet").unwrap();

        assert_eq!(blocking, streamed);
        assert_eq!(streamed.text(), "4");
        assert_eq!(deltas, "4");
        assert_eq!(streamed.stop_reason, StopReason::EndTurn);
        assert_eq!(streamed.model, "claude-sonnet-4");
        assert_eq!(streamed.usage.unwrap().input_tokens, 12);
    }

    #[test]
    fn tool_use_is_handed_back() {
        let out = r#"{"type":"assistant","message":{"id":"msg_2","content":[{"type":"text","text":"Checking."},{"type":"tool_use","id":"t1","name":"get_weather","input":{"city":"Paris"}}],"stop_reason":"tool_use"}}
{"type":"result","subtype":"error_max_turns","is_error":true,"result":""}"#;
        let resp = ClaudeCliBackend
            .parse_blocking_output(out)
            .unwrap()
            .finish("sonnet")
            .unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        let calls = resp.tool_calls();
        assert_eq!(calls[0].id, "t1");
        assert_eq!(calls[0].input["city"], "Paris");
    }

    #[test]
    fn error_result_fails() {
        let out = r#"{"type":"result","subtype":"error_during_execution","is_error":true,"result":"Credit balance is too low"}"#;
        let err = ClaudeCliBackend.parse_blocking_output(out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CliExecution);
        assert!(err.to_string().contains("Credit balance"));
    }

    #[test]
    fn result_text_used_when_no_assistant_message() {
        let mut state = CliStreamState::default();
        let delta = ClaudeCliBackend
            .parse_stream_line(r#"{"type":"result","subtype":"success","is_error":false,"result":"done"}"#, &mut state)
            .unwrap();
        assert_eq!(delta.as_deref(), Some("done"));
        assert_eq!(state.finish("sonnet").unwrap().text(), "done");
    }

    #[test]
    fn garbage_output_is_a_parse_error() {
        let state = ClaudeCliBackend.parse_blocking_output("not json\nat all").unwrap();
        let err = state.finish("sonnet").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CliParse);
    }
}
