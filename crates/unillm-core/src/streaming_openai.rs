//! Stream reducer for the OpenAI Chat Completions API.
//!
//! The OpenAI streaming format sends `data:` lines with JSON payloads
//! containing `choices[].delta` objects.  The stream terminates with a
//! `data: [DONE]` sentinel.

use serde_json::Value;

use crate::error::{LlmError, Result};
use crate::provider::StreamSink;
use crate::streaming::{Flow, SseFrame, StreamReducer, incomplete_stream, json_string, json_u32};
use crate::types::{ContentBlock, Response, StopReason, ToolCall, Usage};

/// Highest tool-call `index` accepted in one response.
const MAX_TOOL_CALL_SLOTS: u64 = 128;

/// Folds OpenAI `chat.completion.chunk` payloads into one [`Response`].
///
/// Tool calls arrive split across chunks and are keyed by their `index`;
/// the id and name come first and the argument JSON trickles in after.
#[derive(Debug, Default)]
pub struct OpenAiStreamReducer {
    /// Response shell, allocated on the first chunk.
    response: Option<Response>,

    text: String,

    /// Partial tool calls, positioned by the chunk's `index`.
    pending_calls: Vec<PendingCall>,

    /// Set once `[DONE]` arrives.
    done: bool,
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments_json: String,
}

impl OpenAiStreamReducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the terminal sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl StreamReducer for OpenAiStreamReducer {
    fn apply(&mut self, frame: &SseFrame, sink: &mut StreamSink<'_, '_>) -> Result<Flow> {
        let data = frame.data.trim();

        if data == "[DONE]" {
            self.done = true;
            return Ok(Flow::Done);
        }

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed OpenAI SSE chunk");
                return Ok(Flow::Continue);
            }
        };

        if let Some(err) = v.get("error").filter(|e| e.is_object()) {
            return Err(crate::http::openai::error_from_body(None, err));
        }

        if self.response.is_none() {
            self.response = Some(Response::new(json_string(&v, "id"), json_string(&v, "model")));
            sink.start();
        }
        let Some(response) = self.response.as_mut() else {
            return Ok(Flow::Continue);
        };

        // Sent on the final chunk when `stream_options.include_usage` is set.
        if let Some(usage_obj) = v.get("usage").filter(|u| u.is_object()) {
            let usage = response.usage.get_or_insert_with(Usage::default);
            if let Some(input) = json_u32(usage_obj, "prompt_tokens") {
                usage.input_tokens = input;
            }
            if let Some(output) = json_u32(usage_obj, "completion_tokens") {
                usage.output_tokens = output;
            }
        }

        let choice = &v["choices"][0];
        if let Some(reason) = choice["finish_reason"].as_str() {
            response.stop_reason = StopReason::from_openai(reason);
        }

        let delta = &choice["delta"];
        if delta.is_null() {
            return Ok(Flow::Continue);
        }

        if let Some(content) = delta["content"].as_str() {
            self.text.push_str(content);
            sink.delta(content);
        }

        for fragment in delta["tool_calls"].as_array().into_iter().flatten() {
            let slot = fragment["index"].as_u64().unwrap_or(0);
            if slot >= MAX_TOOL_CALL_SLOTS {
                return Err(LlmError::invalid_response(format!(
                    "tool call index {slot} out of range"
                )));
            }
            let slot = slot as usize;
            if self.pending_calls.len() <= slot {
                self.pending_calls.resize_with(slot + 1, PendingCall::default);
            }
            let pending = &mut self.pending_calls[slot];

            if let Some(id) = fragment["id"].as_str() {
                pending.id = id.to_owned();
            }
            let function = &fragment["function"];
            if let Some(name) = function["name"].as_str() {
                pending.name.push_str(name);
            }
            if let Some(json) = function["arguments"].as_str() {
                pending.arguments_json.push_str(json);
            }
        }

        Ok(Flow::Continue)
    }

    fn finish(self) -> Result<Response> {
        if !self.done {
            return Err(incomplete_stream());
        }
        // `[DONE]` alone never produced a chunk to build from.
        let Some(mut response) = self.response else {
            return Err(incomplete_stream());
        };

        if !self.text.is_empty() {
            response.content.push(ContentBlock::Text { text: self.text });
        }
        for call in self.pending_calls {
            let input: Value = if call.arguments_json.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&call.arguments_json).map_err(|e| {
                    LlmError::invalid_response(format!(
                        "tool call `{}` streamed unparseable arguments: {e}",
                        call.name
                    ))
                })?
            };
            response.content.push(ContentBlock::ToolUse(ToolCall {
                id: call.id,
                name: call.name,
                input,
            }));
        }

        response.resolve_stop_reason();
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::provider::StreamEvent;

    fn frame(data: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: data.to_owned(),
        }
    }

    fn reduce(lines: &[&str]) -> (Result<Response>, Vec<StreamEvent>) {
        let cancel = CancellationToken::new();
        let mut events = Vec::new();
        let mut cb = |e: StreamEvent| events.push(e);
        let result = {
            let mut sink = StreamSink::new(&mut cb, &cancel);
            let mut reducer = OpenAiStreamReducer::new();
            for line in lines {
                if reducer.apply(&frame(line), &mut sink).unwrap() == Flow::Done {
                    break;
                }
            }
            reducer.finish()
        };
        (result, events)
    }

    #[test]
    fn text_chunks_become_deltas() {
        let (resp, events) = reduce(&[
            r#"{"id":"chatcmpl-1","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"Hello"}}]}"#,
            r#"{"id":"chatcmpl-1","model":"gpt-4o","choices":[{"index":0,"delta":{"content":" world"},"finish_reason":"stop"}]}"#,
            r#"{"id":"chatcmpl-1","choices":[],"usage":{"prompt_tokens":9,"completion_tokens":2}}"#,
            "[DONE]",
        ]);
        let resp = resp.unwrap();
        assert_eq!(resp.id, "chatcmpl-1");
        assert_eq!(resp.text(), "Hello world");
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert_eq!(resp.usage.unwrap().input_tokens, 9);

        assert_eq!(events[0], StreamEvent::Start);
        assert_eq!(events[1], StreamEvent::Delta("Hello".into()));
        assert_eq!(events[2], StreamEvent::Delta(" world".into()));
    }

    #[test]
    fn split_tool_arguments_are_joined() {
        let (resp, _) = reduce(&[
            r#"{"id":"chatcmpl-1","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"open_document","arguments":""}}]}}]}"#,
            r#"{"id":"chatcmpl-1","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\":"}}]}}]}"#,
            r#"{"id":"chatcmpl-1","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"test.txt\"}"}}]},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]);
        let resp = resp.unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        let calls = resp.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_abc");
        assert_eq!(calls[0].name, "open_document");
        assert_eq!(calls[0].input["path"], "test.txt");
    }

    #[test]
    fn parallel_tool_calls_keep_their_slots() {
        let (resp, _) = reduce(&[
            r#"{"id":"c","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"lookup","arguments":"{\"path\":\"a.txt\"}"}}]}}]}"#,
            r#"{"id":"c","choices":[{"index":0,"delta":{"tool_calls":[{"index":1,"id":"call_2","function":{"name":"translate","arguments":"{\"path\":\"b.txt\"}"}}]}}]}"#,
            "[DONE]",
        ]);
        let resp = resp.unwrap();
        let calls = resp.tool_calls();
        assert_eq!(
            calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            ["lookup", "translate"]
        );
        // No finish_reason reported: tool presence decides.
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
    }

    #[test]
    fn missing_done_sentinel_is_an_error() {
        let (resp, events) = reduce(&[
            r#"{"id":"c","choices":[{"index":0,"delta":{"content":"partial"},"finish_reason":"stop"}]}"#,
        ]);
        assert!(resp.is_err());
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn done_without_chunks_is_an_error() {
        let (resp, events) = reduce(&["[DONE]"]);
        let err = resp.unwrap_err();
        assert!(err.to_string().contains("stream ended without a valid response"));
        assert!(events.is_empty());
    }

    #[test]
    fn out_of_range_tool_index_is_rejected() {
        let cancel = CancellationToken::new();
        let mut cb = |_e: StreamEvent| {};
        let mut sink = StreamSink::new(&mut cb, &cancel);
        let mut reducer = OpenAiStreamReducer::new();
        for index in ["18446744073709551615", "1000000000000"] {
            let chunk = format!(
                r#"{{"id":"c","choices":[{{"index":0,"delta":{{"tool_calls":[{{"index":{index},"id":"x","function":{{"name":"f","arguments":"{{}}"}}}}]}}}}]}}"#
            );
            let err = reducer.apply(&frame(&chunk), &mut sink).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::InvalidResponse);
        }
    }

    #[test]
    fn malformed_chunks_are_skipped() {
        let (resp, _) = reduce(&[
            "{invalid json}",
            r#"{"id":"c","choices":[{"index":0,"delta":{"content":"ok"},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ]);
        assert_eq!(resp.unwrap().text(), "ok");
    }

    #[test]
    fn error_payload_aborts() {
        let cancel = CancellationToken::new();
        let mut cb = |_e: StreamEvent| {};
        let mut sink = StreamSink::new(&mut cb, &cancel);
        let mut reducer = OpenAiStreamReducer::new();
        let err = reducer
            .apply(
                &frame(r#"{"error":{"message":"Rate limit reached","type":"rate_limit_exceeded"}}"#),
                &mut sink,
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::RateLimited);
    }
}
