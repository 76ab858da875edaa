//! Server-Sent-Event decoding and the Anthropic stream reducer.
//!
//! [`SseDecoder`] turns raw response bytes into [`SseFrame`]s: an optional
//! `event:` name plus the `data:` lines of one event, terminated by a blank
//! line.  A [`StreamReducer`] folds those frames into a growing
//! [`Response`], reporting text through a [`StreamSink`] as it arrives.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{LlmError, Result};
use crate::provider::StreamSink;
use crate::types::{ContentBlock, Response, StopReason, ToolCall, Usage};

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One complete server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// The `event:` field, if any.
    pub event: Option<String>,
    /// All `data:` lines of the event, joined with `\n`.
    pub data: String,
}

/// Incremental SSE decoder.
///
/// Bytes are buffered until a full line is available, so a multi-byte UTF-8
/// character split across network chunks is decoded correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every frame it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = std::str::from_utf8(&raw)
                .map_err(|e| LlmError::invalid_response(format!("invalid UTF-8 in stream: {e}")))?;
            if let Some(frame) = self.push_line(line.trim_end_matches(['\n', '\r'])) {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// Flush whatever is left once the byte stream has ended.
    pub fn finish(&mut self) -> Result<Option<SseFrame>> {
        if !self.buf.is_empty() {
            let raw = std::mem::take(&mut self.buf);
            let line = String::from_utf8(raw)
                .map_err(|e| LlmError::invalid_response(format!("invalid UTF-8 in stream: {e}")))?;
            if let Some(frame) = self.push_line(line.trim_end_matches('\r')) {
                return Ok(Some(frame));
            }
        }
        Ok(self.dispatch())
    }

    /// Process a single line (without its terminator).
    pub fn push_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            _ => tracing::trace!(field, "ignoring SSE field"),
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        Some(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

// ---------------------------------------------------------------------------
// Reducer contract
// ---------------------------------------------------------------------------

/// Whether a reducer expects more frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The terminal event was seen.
    Done,
}

/// Folds a frame sequence into a [`Response`].
pub trait StreamReducer: Send {
    /// Apply one frame.  Text appended to the response is reported through
    /// `sink` as exactly the new substring.
    fn apply(&mut self, frame: &SseFrame, sink: &mut StreamSink<'_, '_>) -> Result<Flow>;

    /// Produce the final response.  Fails unless the terminal event was seen.
    fn finish(self) -> Result<Response>
    where
        Self: Sized;
}

/// Error returned when a stream stops before its terminal event.
pub(crate) fn incomplete_stream() -> LlmError {
    LlmError::invalid_response("stream ended without a valid response")
}

// ---------------------------------------------------------------------------
// Anthropic reducer
// ---------------------------------------------------------------------------

/// A content block still receiving deltas.
#[derive(Debug)]
enum PendingBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        /// Raw `input_json_delta` fragments, parsed once at block stop.
        input_json: String,
    },
}

impl PendingBlock {
    fn finalize(self) -> Result<ContentBlock> {
        match self {
            Self::Text(text) => Ok(ContentBlock::Text { text }),
            Self::ToolUse {
                id,
                name,
                input_json,
            } => {
                let input = if input_json.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&input_json).map_err(|e| {
                        LlmError::invalid_response(format!(
                            "invalid JSON in tool call `{name}` input: {e}"
                        ))
                    })?
                };
                Ok(ContentBlock::ToolUse(ToolCall { id, name, input }))
            }
        }
    }
}

/// Reducer for the Anthropic Messages streaming format.
#[derive(Debug, Default)]
pub struct AnthropicStreamReducer {
    response: Option<Response>,
    pending: BTreeMap<u64, PendingBlock>,
    /// Set by `message_start`; a stream without it carries no id or model.
    started: bool,
    done: bool,
}

impl AnthropicStreamReducer {
    pub fn new() -> Self {
        Self::default()
    }

    fn shell(&mut self) -> &mut Response {
        self.response.get_or_insert_with(Response::default)
    }

    fn close_block(&mut self, index: u64) -> Result<()> {
        if let Some(block) = self.pending.remove(&index) {
            let block = block.finalize()?;
            self.shell().content.push(block);
        } else {
            tracing::trace!(index, "content_block_stop for unknown block");
        }
        Ok(())
    }
}

impl StreamReducer for AnthropicStreamReducer {
    fn apply(&mut self, frame: &SseFrame, sink: &mut StreamSink<'_, '_>) -> Result<Flow> {
        if self.done {
            return Ok(Flow::Done);
        }

        let v: Value = match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(e) => {
                // `message_stop` carries a body, but tolerate one without it.
                if frame.event.as_deref() == Some("message_stop") {
                    Value::Null
                } else {
                    tracing::warn!(event = ?frame.event, error = %e, "skipping malformed SSE event");
                    return Ok(Flow::Continue);
                }
            }
        };

        let event_type = frame
            .event
            .clone()
            .or_else(|| v["type"].as_str().map(String::from))
            .unwrap_or_default();

        match event_type.as_str() {
            "message_start" => {
                let message = &v["message"];
                let response = self.shell();
                response.id = json_string(message, "id");
                response.model = json_string(message, "model");
                let usage = &message["usage"];
                response.usage = Some(Usage {
                    input_tokens: json_u32(usage, "input_tokens").unwrap_or(0),
                    output_tokens: json_u32(usage, "output_tokens").unwrap_or(0),
                });
                self.started = true;
                sink.start();
            }

            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let block = &v["content_block"];
                let pending = match block["type"].as_str() {
                    Some("tool_use") => PendingBlock::ToolUse {
                        id: json_string(block, "id"),
                        name: json_string(block, "name"),
                        input_json: String::new(),
                    },
                    Some("text") => PendingBlock::Text(String::new()),
                    other => {
                        tracing::trace!(block_type = ?other, "ignoring content block");
                        return Ok(Flow::Continue);
                    }
                };
                self.shell();
                self.pending.insert(index, pending);
                // Some servers put initial text on the start event.
                if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty())
                    && let Some(PendingBlock::Text(buf)) = self.pending.get_mut(&index)
                {
                    buf.push_str(text);
                    sink.delta(text);
                }
            }

            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let delta = &v["delta"];
                match (delta["type"].as_str(), self.pending.get_mut(&index)) {
                    (Some("text_delta"), Some(PendingBlock::Text(buf))) => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        buf.push_str(text);
                        sink.delta(text);
                    }
                    (Some("input_json_delta"), Some(PendingBlock::ToolUse { input_json, .. })) => {
                        input_json.push_str(delta["partial_json"].as_str().unwrap_or_default());
                    }
                    (delta_type, _) => {
                        tracing::trace!(index, ?delta_type, "ignoring unmatched delta");
                    }
                }
            }

            "content_block_stop" => {
                let index = v["index"].as_u64().unwrap_or(0);
                self.close_block(index)?;
            }

            "message_delta" => {
                let response = self.shell();
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    response.stop_reason = StopReason::from_anthropic(reason);
                }
                let usage_obj = &v["usage"];
                if usage_obj.is_object() {
                    let usage = response.usage.get_or_insert_with(Usage::default);
                    if let Some(output) = json_u32(usage_obj, "output_tokens") {
                        usage.output_tokens = output;
                    }
                    if let Some(input) = json_u32(usage_obj, "input_tokens").filter(|n| *n > 0) {
                        usage.input_tokens = input;
                    }
                }
            }

            "message_stop" => {
                let open: Vec<u64> = self.pending.keys().copied().collect();
                for index in open {
                    self.close_block(index)?;
                }
                self.done = true;
                return Ok(Flow::Done);
            }

            "error" => {
                return Err(crate::http::anthropic::error_from_body(None, &v));
            }

            "ping" => {}

            other => tracing::trace!(event_type = other, "ignoring unknown SSE event type"),
        }

        Ok(Flow::Continue)
    }

    fn finish(self) -> Result<Response> {
        if !self.done || !self.started {
            return Err(incomplete_stream());
        }
        let mut response = self.response.ok_or_else(incomplete_stream)?;
        response.resolve_stop_reason();
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extract a string field, returning an empty string if missing.
pub(crate) fn json_string(v: &Value, field: &str) -> String {
    v[field].as_str().unwrap_or_default().to_owned()
}

/// Extract a non-negative integer field.
pub(crate) fn json_u32(v: &Value, field: &str) -> Option<u32> {
    v[field].as_u64().map(|n| n.min(u32::MAX as u64) as u32)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::provider::StreamEvent;

    const TEXT_STREAM: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_01\",\"model\":\"claude-sonnet-4-20250514\",\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: ping\n",
        "data: {\"type\":\"ping\"}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\", world\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":7}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    fn run(input: &[u8], chunk: usize) -> (Result<Response>, Vec<StreamEvent>) {
        let cancel = CancellationToken::new();
        let mut events = Vec::new();
        let mut cb = |e: StreamEvent| events.push(e);
        let result = {
            let mut sink = StreamSink::new(&mut cb, &cancel);
            let mut decoder = SseDecoder::new();
            let mut reducer = AnthropicStreamReducer::new();
            let mut outcome = None;
            'outer: for piece in input.chunks(chunk) {
                for frame in decoder.feed(piece).unwrap() {
                    match reducer.apply(&frame, &mut sink) {
                        Ok(Flow::Done) => break 'outer,
                        Ok(Flow::Continue) => {}
                        Err(e) => {
                            outcome = Some(Err(e));
                            break 'outer;
                        }
                    }
                }
            }
            outcome.unwrap_or_else(|| reducer.finish())
        };
        (result, events)
    }

    #[test]
    fn decoder_joins_multiline_data_and_skips_comments() {
        let mut decoder = SseDecoder::new();
        let frames = decoder
            .feed(b": keepalive\nevent: x\ndata: a\ndata: b\n\ndata: c\n\n")
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("x"));
        assert_eq!(frames[0].data, "a\nb");
        assert_eq!(frames[1].event, None);
        assert_eq!(frames[1].data, "c");
    }

    #[test]
    fn decoder_handles_split_utf8_and_crlf() {
        let mut decoder = SseDecoder::new();
        let bytes = "data: héllo\r\n\r\n".as_bytes();
        // Split inside the two-byte `é`.
        let mut frames = decoder.feed(&bytes[..8]).unwrap();
        frames.extend(decoder.feed(&bytes[8..]).unwrap());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "héllo");
    }

    #[test]
    fn decoder_flushes_unterminated_frame() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: [DONE]").unwrap().is_empty());
        let frame = decoder.finish().unwrap().unwrap();
        assert_eq!(frame.data, "[DONE]");
    }

    #[test]
    fn text_stream_deltas_concatenate_to_final_text() {
        for chunk in [1, 7, 64, TEXT_STREAM.len()] {
            let (result, events) = run(TEXT_STREAM.as_bytes(), chunk);
            let response = result.unwrap();
            assert_eq!(response.id, "msg_01");
            assert_eq!(response.text(), "Hello, world");
            assert_eq!(response.stop_reason, StopReason::EndTurn);

            let usage = response.usage.unwrap();
            assert_eq!(usage.input_tokens, 12, "input tokens survive message_delta");
            assert_eq!(usage.output_tokens, 7);

            assert_eq!(events[0], StreamEvent::Start);
            let streamed: String = events
                .iter()
                .filter_map(|e| match e {
                    StreamEvent::Delta(t) => Some(t.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(streamed, response.text());
            assert_eq!(
                events.iter().filter(|e| **e == StreamEvent::Start).count(),
                1
            );
        }
    }

    #[test]
    fn tool_use_json_is_parsed_once_at_block_stop() {
        let input = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_02\",\"model\":\"m\",\"usage\":{\"input_tokens\":5}}}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"check weather\"}}\n\n",
            "event: content_block_stop\n",
            "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"t1\",\"name\":\"get_weather\",\"input\":{}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"loca\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"tion\\\":\\\"SF\\\"}\"}}\n\n",
            "event: content_block_stop\n",
            "data: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":30}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );

        let (result, events) = run(input.as_bytes(), 16);
        let response = result.unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.content.len(), 2);
        let calls = response.tool_calls();
        assert_eq!(calls[0].id, "t1");
        assert_eq!(calls[0].input["location"], "SF");

        // Tool JSON never leaks into text deltas.
        let deltas: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Delta(_)))
            .collect();
        assert_eq!(deltas, vec![&StreamEvent::Delta("check weather".into())]);
    }

    #[test]
    fn malformed_events_are_skipped() {
        let input = TEXT_STREAM.replacen(
            "event: ping\ndata: {\"type\":\"ping\"}",
            "event: content_block_delta\ndata: {not json",
            1,
        );
        let (result, _) = run(input.as_bytes(), 32);
        assert_eq!(result.unwrap().text(), "Hello, world");
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let cut = TEXT_STREAM.find("event: message_stop").unwrap();
        let (result, events) = run(&TEXT_STREAM.as_bytes()[..cut], 32);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("stream ended without a valid response"));
        // Deltas already emitted stay emitted, but no End.
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::End(_))));
    }

    #[test]
    fn empty_stream_is_an_error() {
        let (result, events) = run(b"", 1);
        assert!(result.is_err());
        assert!(events.is_empty());
    }

    #[test]
    fn stream_without_message_start_is_an_error() {
        let start = TEXT_STREAM.find("event: content_block_start").unwrap();
        let (result, events) = run(&TEXT_STREAM.as_bytes()[start..], 32);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("stream ended without a valid response"));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::End(_))));
    }

    #[test]
    fn error_event_aborts_stream() {
        let input = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"m\",\"model\":\"m\"}}\n\n",
            "event: error\n",
            "data: {\"type\":\"error\",\"error\":{\"type\":\"rate_limit_error\",\"message\":\"slow down\"}}\n\n",
        );
        let (result, _) = run(input.as_bytes(), 64);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::RateLimited);
    }
}
