//! Anthropic Messages wire types and normalized conversions

use crate::{IngressError, IngressResult};
use nimbus_core::normalized::{
    ContentPart, Message, MessageContent, NormalizedRequest, NormalizedResponse, Role, Tool,
    ToolCall, ToolChoice,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum size for serialized tool arguments (1MB)
const MAX_TOOL_ARGS_SIZE: usize = 1_000_000;

/// Anthropic system parameter (string or array of text blocks)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnthropicSystem {
    Text(String),
    Blocks(Vec<AnthropicSystemBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicSystemBlock {
    Text { text: String },
}

/// Anthropic messages request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessagesRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<AnthropicSystem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<AnthropicToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AnthropicMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<AnthropicMessageContent>,
}

/// Message content: plain string or array of content blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnthropicMessageContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

/// Request content block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicContentBlock {
    Text {
        text: String,
    },
    Image {
        source: AnthropicImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<AnthropicToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Tool result payloads arrive as a string or as nested text blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnthropicToolResultContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

impl AnthropicToolResultContent {
    fn to_text(&self) -> String {
        match self {
            AnthropicToolResultContent::Text(text) => text.clone(),
            AnthropicToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    AnthropicContentBlock::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicToolChoice {
    Auto,
    Any,
    Tool { name: String },
    None,
}

/// Anthropic response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub role: String,
    pub content: Vec<AnthropicResponseContent>,
    pub model: String,
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: AnthropicUsage,
}

/// Response content block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicResponseContent {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AnthropicUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

fn validate_request(req: &AnthropicMessagesRequest) -> IngressResult<()> {
    if req.model.is_empty() {
        return Err(IngressError::InvalidRequest(
            "model field cannot be empty".to_string(),
        ));
    }
    if req.model.len() > 256 {
        return Err(IngressError::InvalidRequest(format!(
            "model name too long: {} chars (max 256)",
            req.model.len()
        )));
    }

    if req.messages.is_empty() {
        return Err(IngressError::InvalidRequest(
            "messages array cannot be empty".to_string(),
        ));
    }

    if let Some(temp) = req.temperature {
        if !(0.0..=1.0).contains(&temp) {
            return Err(IngressError::InvalidRequest(format!(
                "temperature must be between 0.0 and 1.0, got {}",
                temp
            )));
        }
    }

    if let Some(top_p) = req.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            return Err(IngressError::InvalidRequest(format!(
                "top_p must be between 0.0 and 1.0, got {}",
                top_p
            )));
        }
    }

    if let Some(max_tokens) = req.max_tokens {
        if max_tokens == 0 {
            return Err(IngressError::InvalidRequest(
                "max_tokens must be greater than 0".to_string(),
            ));
        }
    }

    if let Some(tools) = &req.tools {
        for tool in tools {
            if !tool.input_schema.is_object() {
                return Err(IngressError::InvalidRequest(format!(
                    "Tool '{}': input_schema must be a JSON Schema object",
                    tool.name
                )));
            }
        }
    }

    Ok(())
}

/// Convert an Anthropic request to the normalized model.
///
/// Assistant `tool_use` blocks become `tool_calls`; each `tool_result` block
/// in a user message expands into its own tool-role message, ordered before
/// any accompanying user text (the OpenAI dialect requires tool messages to
/// directly follow the assistant's tool calls).
pub fn to_normalized(req: AnthropicMessagesRequest) -> IngressResult<NormalizedRequest> {
    validate_request(&req)?;

    let mut messages: Vec<Message> = Vec::with_capacity(req.messages.len());
    for msg in req.messages {
        let role = match msg.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(IngressError::InvalidRequest(format!(
                    "Invalid role: {} (only 'user' and 'assistant' are accepted)",
                    other
                )))
            }
        };

        let content = msg
            .content
            .unwrap_or(AnthropicMessageContent::Text(String::new()));

        match content {
            AnthropicMessageContent::Text(text) => {
                messages.push(Message::text(role, text));
            }
            AnthropicMessageContent::Blocks(blocks) => {
                let mut parts: Vec<ContentPart> = Vec::new();
                let mut tool_calls: Vec<ToolCall> = Vec::new();
                let mut tool_results: Vec<Message> = Vec::new();

                for block in blocks {
                    match block {
                        AnthropicContentBlock::Text { text } => {
                            parts.push(ContentPart::Text { text });
                        }
                        AnthropicContentBlock::Image { source } => {
                            parts.push(ContentPart::Image {
                                media_type: source
                                    .media_type
                                    .unwrap_or_else(|| "image".to_string()),
                            });
                        }
                        AnthropicContentBlock::ToolUse { id, name, input } => {
                            let arguments = serde_json::to_string(&input).map_err(|e| {
                                IngressError::InvalidRequest(format!(
                                    "Invalid tool input for '{}': {}",
                                    name, e
                                ))
                            })?;
                            if arguments.len() > MAX_TOOL_ARGS_SIZE {
                                return Err(IngressError::InvalidRequest(format!(
                                    "Tool arguments too large for '{}': {} bytes",
                                    name,
                                    arguments.len()
                                )));
                            }
                            tool_calls.push(ToolCall {
                                id,
                                name,
                                arguments,
                            });
                        }
                        AnthropicContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            tool_results.push(Message {
                                role: Role::Tool,
                                content: MessageContent::Text(
                                    content.map(|c| c.to_text()).unwrap_or_default(),
                                ),
                                tool_calls: Vec::new(),
                                tool_call_id: Some(tool_use_id),
                                is_error,
                            });
                        }
                    }
                }

                let had_tool_results = !tool_results.is_empty();
                messages.append(&mut tool_results);

                // A message that carried only tool_result blocks does not
                // also produce an empty user message; one with no blocks at
                // all still yields an empty text message so the conversation
                // shape is preserved.
                if !parts.is_empty() || !tool_calls.is_empty() || !had_tool_results {
                    let content = if parts.len() == 1 {
                        match parts.into_iter().next().expect("len checked") {
                            ContentPart::Text { text } => MessageContent::Text(text),
                            part => MessageContent::Parts(vec![part]),
                        }
                    } else {
                        MessageContent::Parts(parts)
                    };
                    messages.push(Message {
                        role,
                        content,
                        tool_calls,
                        tool_call_id: None,
                        is_error: false,
                    });
                }
            }
        }
    }

    let tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| Tool {
            name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
        })
        .collect();

    let tool_choice = req.tool_choice.map(|tc| match tc {
        AnthropicToolChoice::Auto => ToolChoice::Auto,
        AnthropicToolChoice::Any => ToolChoice::Any,
        AnthropicToolChoice::Tool { name } => ToolChoice::Tool { name },
        AnthropicToolChoice::None => ToolChoice::None,
    });

    let system = req.system.map(|sys| match sys {
        AnthropicSystem::Text(text) => text,
        AnthropicSystem::Blocks(blocks) => blocks
            .into_iter()
            .map(|AnthropicSystemBlock::Text { text }| text)
            .collect::<Vec<_>>()
            .join("\n"),
    });

    let mut metadata = HashMap::new();
    if let Some(meta) = req.metadata {
        if let Some(user_id) = meta.user_id {
            metadata.insert("user_id".to_string(), serde_json::Value::String(user_id));
        }
    }

    Ok(NormalizedRequest {
        messages,
        system,
        model: req.model,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        stop_sequences: req.stop_sequences.unwrap_or_default(),
        stream: req.stream.unwrap_or(false),
        tools,
        tool_choice,
        metadata,
    })
}

/// Convert a normalized response back to the Anthropic wire shape.
pub fn from_normalized(resp: NormalizedResponse) -> AnthropicResponse {
    let mut content = Vec::new();

    let text = resp.message.content.to_text();
    if !text.is_empty() {
        content.push(AnthropicResponseContent::Text { text });
    }

    for call in &resp.message.tool_calls {
        let input = serde_json::from_str(&call.arguments).unwrap_or_else(|e| {
            tracing::warn!(
                tool = %call.name,
                error = %e,
                "tool call arguments were not valid JSON, substituting empty object"
            );
            serde_json::Value::Object(serde_json::Map::new())
        });
        content.push(AnthropicResponseContent::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input,
        });
    }

    AnthropicResponse {
        id: resp.id,
        type_: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: resp.model,
        stop_reason: resp.finish_reason.map(|fr| fr.as_anthropic().to_string()),
        stop_sequence: resp.stop_sequence,
        usage: AnthropicUsage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
        },
    }
}
