//! Anthropic SSE encoding
//!
//! [`AnthropicSseEncoder`] turns a stream of normalized events into the named
//! Anthropic event sequence: `message_start`, `ping`, one or more
//! `(content_block_start, content_block_delta*, content_block_stop)` groups,
//! `message_delta`, `message_stop`. The encoder is stateful per stream; it
//! opens and closes content blocks as the normalized events switch between
//! text and tool calls, and counts output tokens itself because OpenAI
//! upstreams do not stream usage.

use crate::count_tokens::estimate_text_tokens;
use nimbus_core::normalized::NormalizedStreamEvent;
use serde_json::json;
use uuid::Uuid;

/// One wire-ready SSE frame (`event: <name>\ndata: <json>\n\n`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    fn new(event: &str, data: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    /// Render in wire format.
    pub fn to_wire(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }

    pub fn is_error(&self) -> bool {
        self.event == "error"
    }

    pub fn is_terminal(&self) -> bool {
        self.event == "message_stop" || self.event == "error"
    }

    /// Build the inline error frame used when a stream fails after bytes have
    /// been flushed downstream.
    pub fn error(error_type: &str, message: &str) -> Self {
        Self::new(
            "error",
            json!({
                "type": "error",
                "error": {"type": error_type, "message": message},
            }),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    ToolUse,
}

/// Stateful normalized-events → Anthropic SSE translator
pub struct AnthropicSseEncoder {
    message_id: String,
    model: String,
    started: bool,
    finished: bool,
    open_block: Option<OpenBlock>,
    next_index: u32,
    current_index: u32,
    /// Which upstream call the open tool block belongs to
    open_tool_call: Option<u32>,
    /// Accumulated output text for the final token estimate
    output_text: String,
    input_tokens: u32,
    upstream_output_tokens: Option<u32>,
}

impl AnthropicSseEncoder {
    /// Create an encoder for one stream. `model` is the client-requested
    /// model name, echoed in `message_start`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            model: model.into(),
            started: false,
            finished: false,
            open_block: None,
            next_index: 0,
            current_index: 0,
            open_tool_call: None,
            output_text: String::new(),
            input_tokens: 0,
            upstream_output_tokens: None,
        }
    }

    /// Encode one normalized event into zero or more frames.
    pub fn encode(&mut self, event: NormalizedStreamEvent) -> Vec<SseFrame> {
        match event {
            NormalizedStreamEvent::Start { .. } => self.ensure_started(),
            NormalizedStreamEvent::TextDelta { text } => {
                let mut frames = self.ensure_started();
                if self.open_block == Some(OpenBlock::ToolUse) {
                    frames.push(self.close_block());
                }
                if self.open_block.is_none() {
                    frames.push(self.open_text_block());
                }
                self.output_text.push_str(&text);
                frames.push(SseFrame::new(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.current_index,
                        "delta": {"type": "text_delta", "text": text},
                    }),
                ));
                frames
            }
            NormalizedStreamEvent::ToolCallDelta {
                call_index,
                id,
                name,
                arguments,
            } => {
                let mut frames = self.ensure_started();

                let switching = self.open_tool_call != Some(call_index)
                    || self.open_block != Some(OpenBlock::ToolUse);
                if switching {
                    if self.open_block.is_some() {
                        frames.push(self.close_block());
                    }
                    let index = self.next_index;
                    self.next_index += 1;
                    self.current_index = index;
                    self.open_block = Some(OpenBlock::ToolUse);
                    self.open_tool_call = Some(call_index);

                    let tool_id =
                        id.unwrap_or_else(|| format!("toolu_{}", Uuid::new_v4().simple()));
                    frames.push(SseFrame::new(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": index,
                            "content_block": {
                                "type": "tool_use",
                                "id": tool_id,
                                "name": name.clone().unwrap_or_default(),
                                "input": {},
                            },
                        }),
                    ));
                }

                // Argument fragments are forwarded verbatim: individually
                // they need not be valid JSON, concatenated they must be.
                if let Some(fragment) = arguments {
                    if !fragment.is_empty() {
                        self.output_text.push_str(&fragment);
                        frames.push(SseFrame::new(
                            "content_block_delta",
                            json!({
                                "type": "content_block_delta",
                                "index": self.current_index,
                                "delta": {"type": "input_json_delta", "partial_json": fragment},
                            }),
                        ));
                    }
                }
                frames
            }
            NormalizedStreamEvent::Usage { usage } => {
                if usage.input_tokens > 0 {
                    self.input_tokens = usage.input_tokens;
                }
                if usage.output_tokens > 0 {
                    self.upstream_output_tokens = Some(usage.output_tokens);
                }
                Vec::new()
            }
            NormalizedStreamEvent::End {
                finish_reason,
                stop_sequence,
            } => {
                if self.finished {
                    return Vec::new();
                }
                self.finished = true;
                let mut frames = self.ensure_started();
                if self.open_block.is_some() {
                    frames.push(self.close_block());
                }
                let output_tokens = self
                    .upstream_output_tokens
                    .unwrap_or_else(|| estimate_text_tokens(&self.output_text));
                frames.push(SseFrame::new(
                    "message_delta",
                    json!({
                        "type": "message_delta",
                        "delta": {
                            "stop_reason": finish_reason.as_anthropic(),
                            "stop_sequence": stop_sequence,
                        },
                        "usage": {"output_tokens": output_tokens},
                    }),
                ));
                frames.push(SseFrame::new("message_stop", json!({"type": "message_stop"})));
                frames
            }
            NormalizedStreamEvent::Error {
                error_type,
                message,
            } => {
                self.finished = true;
                vec![SseFrame::error(&error_type, &message)]
            }
        }
    }

    /// Close the stream after an upstream failure that was not announced by
    /// an `End` or `Error` event.
    pub fn encode_failure(&mut self, error_type: &str, message: &str) -> Vec<SseFrame> {
        self.finished = true;
        vec![SseFrame::error(error_type, message)]
    }

    /// Whether the terminal frames have already been emitted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn ensure_started(&mut self) -> Vec<SseFrame> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        vec![
            SseFrame::new(
                "message_start",
                json!({
                    "type": "message_start",
                    "message": {
                        "id": self.message_id,
                        "type": "message",
                        "role": "assistant",
                        "model": self.model,
                        "content": [],
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": self.input_tokens, "output_tokens": 0},
                    },
                }),
            ),
            SseFrame::new("ping", json!({"type": "ping"})),
        ]
    }

    fn open_text_block(&mut self) -> SseFrame {
        let index = self.next_index;
        self.next_index += 1;
        self.current_index = index;
        self.open_block = Some(OpenBlock::Text);
        SseFrame::new(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "text", "text": ""},
            }),
        )
    }

    fn close_block(&mut self) -> SseFrame {
        let index = self.current_index;
        self.open_block = None;
        self.open_tool_call = None;
        SseFrame::new(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": index}),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::normalized::{FinishReason, Usage};

    fn text(s: &str) -> NormalizedStreamEvent {
        NormalizedStreamEvent::TextDelta {
            text: s.to_string(),
        }
    }

    fn end() -> NormalizedStreamEvent {
        NormalizedStreamEvent::End {
            finish_reason: FinishReason::Stop,
            stop_sequence: None,
        }
    }

    fn event_names(frames: &[SseFrame]) -> Vec<&str> {
        frames.iter().map(|f| f.event.as_str()).collect()
    }

    #[test]
    fn test_text_stream_event_sequence() {
        let mut encoder = AnthropicSseEncoder::new("claude-3-5-sonnet-20241022");
        let mut frames = Vec::new();
        frames.extend(encoder.encode(text("Hello")));
        frames.extend(encoder.encode(text(" world")));
        frames.extend(encoder.encode(end()));

        assert_eq!(
            event_names(&frames),
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn test_message_start_carries_model_and_generated_id() {
        let mut encoder = AnthropicSseEncoder::new("claude-3-5-haiku-20241022");
        let frames = encoder.encode(text("x"));
        let start: serde_json::Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(start["message"]["model"], "claude-3-5-haiku-20241022");
        assert!(start["message"]["id"]
            .as_str()
            .unwrap()
            .starts_with("msg_"));
    }

    #[test]
    fn test_tool_call_block_lifecycle() {
        let mut encoder = AnthropicSseEncoder::new("m");
        let mut frames = Vec::new();
        frames.extend(encoder.encode(text("Let me check.")));
        frames.extend(encoder.encode(NormalizedStreamEvent::ToolCallDelta {
            call_index: 0,
            id: Some("call_1".to_string()),
            name: Some("get_weather".to_string()),
            arguments: None,
        }));
        frames.extend(encoder.encode(NormalizedStreamEvent::ToolCallDelta {
            call_index: 0,
            id: None,
            name: None,
            arguments: Some("{\"loc".to_string()),
        }));
        frames.extend(encoder.encode(NormalizedStreamEvent::ToolCallDelta {
            call_index: 0,
            id: None,
            name: None,
            arguments: Some("ation\":\"Paris\"}".to_string()),
        }));
        frames.extend(encoder.encode(NormalizedStreamEvent::End {
            finish_reason: FinishReason::ToolCalls,
            stop_sequence: None,
        }));

        let names = event_names(&frames);
        // Text block closed before the tool block opens
        let stop_pos = names
            .iter()
            .position(|n| *n == "content_block_stop")
            .unwrap();
        let tool_start_pos = names
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == "content_block_start")
            .nth(1)
            .unwrap()
            .0;
        assert!(stop_pos < tool_start_pos);

        // The tool block start announces id and name
        let tool_start: serde_json::Value =
            serde_json::from_str(&frames[tool_start_pos].data).unwrap();
        assert_eq!(tool_start["content_block"]["type"], "tool_use");
        assert_eq!(tool_start["content_block"]["name"], "get_weather");
        assert_eq!(tool_start["index"], 1);

        // Concatenated partial_json fragments parse as JSON
        let mut concatenated = String::new();
        for frame in &frames {
            if frame.event == "content_block_delta" {
                let value: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
                if value["delta"]["type"] == "input_json_delta" {
                    concatenated.push_str(value["delta"]["partial_json"].as_str().unwrap());
                }
            }
        }
        let parsed: serde_json::Value = serde_json::from_str(&concatenated).unwrap();
        assert_eq!(parsed["location"], "Paris");

        // Stop reason mapped to tool_use
        let delta_frame = frames.iter().find(|f| f.event == "message_delta").unwrap();
        let delta: serde_json::Value = serde_json::from_str(&delta_frame.data).unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn test_output_tokens_estimated_when_upstream_silent() {
        let mut encoder = AnthropicSseEncoder::new("m");
        encoder.encode(text("one two three four five"));
        let frames = encoder.encode(end());
        let delta_frame = frames.iter().find(|f| f.event == "message_delta").unwrap();
        let delta: serde_json::Value = serde_json::from_str(&delta_frame.data).unwrap();
        assert!(delta["usage"]["output_tokens"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_upstream_usage_preferred_over_estimate() {
        let mut encoder = AnthropicSseEncoder::new("m");
        encoder.encode(text("hello"));
        encoder.encode(NormalizedStreamEvent::Usage {
            usage: Usage {
                input_tokens: 12,
                output_tokens: 34,
            },
        });
        let frames = encoder.encode(end());
        let delta_frame = frames.iter().find(|f| f.event == "message_delta").unwrap();
        let delta: serde_json::Value = serde_json::from_str(&delta_frame.data).unwrap();
        assert_eq!(delta["usage"]["output_tokens"], 34);
    }

    #[test]
    fn test_error_event_renders_error_frame() {
        let mut encoder = AnthropicSseEncoder::new("m");
        let frames = encoder.encode(NormalizedStreamEvent::Error {
            error_type: "overloaded_error".to_string(),
            message: "try later".to_string(),
        });
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_error());
        assert!(frames[0].is_terminal());
        let value: serde_json::Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(value["error"]["type"], "overloaded_error");
    }

    #[test]
    fn test_end_without_content_still_terminates() {
        let mut encoder = AnthropicSseEncoder::new("m");
        let frames = encoder.encode(end());
        assert_eq!(
            event_names(&frames),
            vec!["message_start", "ping", "message_delta", "message_stop"]
        );
    }

    #[test]
    fn test_double_end_ignored() {
        let mut encoder = AnthropicSseEncoder::new("m");
        encoder.encode(end());
        assert!(encoder.encode(end()).is_empty());
        assert!(encoder.is_finished());
    }

    #[test]
    fn test_wire_format() {
        let frame = SseFrame::error("api_error", "boom");
        let wire = frame.to_wire();
        assert!(wire.starts_with("event: error\ndata: {"));
        assert!(wire.ends_with("\n\n"));
    }
}
