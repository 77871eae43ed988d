//! Normalized request and response types
//!
//! Every translation path (Anthropic wire in, OpenAI or Anthropic wire out)
//! converts through this provider-neutral model, so each adapter only has to
//! know its own dialect.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Normalized request that can represent an inbound call from any dialect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRequest {
    /// Conversation messages in order
    pub messages: Vec<Message>,

    /// Optional system prompt
    pub system: Option<String>,

    /// Model identifier as requested by the client
    pub model: String,

    /// Maximum number of tokens to generate
    pub max_tokens: Option<u32>,

    /// Sampling temperature
    pub temperature: Option<f32>,

    /// Nucleus sampling threshold
    pub top_p: Option<f32>,

    /// Top-k sampling (no OpenAI equivalent, dropped on that path)
    pub top_k: Option<u32>,

    /// Stop sequences
    pub stop_sequences: Vec<String>,

    /// Whether the client asked for a streaming response
    pub stream: bool,

    /// Available tools
    pub tools: Vec<Tool>,

    /// Tool choice configuration
    pub tool_choice: Option<ToolChoice>,

    /// Additional metadata (e.g. `user_id`) that does not affect routing
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A single message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    /// Text content of the message
    pub content: MessageContent,

    /// Tool calls made in this message (assistant messages)
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,

    /// Tool call this message is a result for (tool-role messages)
    pub tool_call_id: Option<String>,

    /// Whether a tool result reported an execution error
    #[serde(default)]
    pub is_error: bool,
}

impl Message {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Content of a message (plain text or multimodal parts)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flatten to plain text, joining parts with newlines. Image parts are
    /// replaced by a bracketed placeholder rather than dropped mid-content.
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => text.clone(),
                    ContentPart::Image { media_type } => {
                        format!("[image omitted: {}]", media_type)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A part of multimodal content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Image reference kept only as its media type; providers without image
    /// support receive a text placeholder instead.
    Image { media_type: String },
}

/// Tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: Option<String>,
    /// JSON schema for the tool input
    pub input_schema: serde_json::Value,
}

/// Tool choice configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model decides whether to use a tool
    Auto,
    /// Model must use some tool
    Any,
    /// Model must use the named tool
    Tool { name: String },
    /// Model must not use tools
    None,
}

/// A tool call made by the assistant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique id for this call (Anthropic `toolu_*` format on the client side)
    pub id: String,
    pub name: String,
    /// Arguments as a JSON string
    pub arguments: String,
}

/// Normalized response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub id: String,
    pub model: String,
    pub message: Message,
    pub finish_reason: Option<FinishReason>,
    /// Stop sequence that terminated generation, when one matched
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

/// Reason generation finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop point
    Stop,
    /// A configured stop sequence matched
    StopSequence,
    /// Max tokens reached
    Length,
    /// One or more tools were called
    ToolCalls,
    /// Content was filtered by the upstream
    ContentFilter,
}

impl FinishReason {
    /// Anthropic `stop_reason` string for this finish reason.
    pub fn as_anthropic(self) -> &'static str {
        match self {
            FinishReason::Stop => "end_turn",
            FinishReason::StopSequence => "stop_sequence",
            FinishReason::Length => "max_tokens",
            FinishReason::ToolCalls => "tool_use",
            // content_filter has no Anthropic equivalent; surfaced as a
            // stop-sequence style termination
            FinishReason::ContentFilter => "stop_sequence",
        }
    }
}

/// Token usage
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Stream event during response generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedStreamEvent {
    /// Stream opened upstream; id/model may be placeholders for providers
    /// that do not announce them
    Start { id: String, model: String },

    /// Text fragment
    TextDelta { text: String },

    /// Tool call progress. The first event for a call carries `id` and
    /// `name`; subsequent events carry argument fragments that concatenate
    /// into valid JSON.
    ToolCallDelta {
        /// Upstream index distinguishing parallel tool calls
        call_index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },

    /// Usage totals, reported when the upstream provides them
    Usage { usage: Usage },

    /// Generation finished
    End {
        finish_reason: FinishReason,
        stop_sequence: Option<String>,
    },

    /// Upstream signalled an error inside the stream
    Error { error_type: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_to_text_joins_parts() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "hello".to_string(),
            },
            ContentPart::Text {
                text: "world".to_string(),
            },
        ]);
        assert_eq!(content.to_text(), "hello\nworld");
    }

    #[test]
    fn test_image_parts_become_placeholders() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "look:".to_string(),
            },
            ContentPart::Image {
                media_type: "image/png".to_string(),
            },
        ]);
        assert_eq!(content.to_text(), "look:\n[image omitted: image/png]");
    }

    #[test]
    fn test_finish_reason_anthropic_names() {
        assert_eq!(FinishReason::Stop.as_anthropic(), "end_turn");
        assert_eq!(FinishReason::Length.as_anthropic(), "max_tokens");
        assert_eq!(FinishReason::ToolCalls.as_anthropic(), "tool_use");
        assert_eq!(FinishReason::ContentFilter.as_anthropic(), "stop_sequence");
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        let role: Role = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(role, Role::User);
    }
}
