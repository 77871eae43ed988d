//! Anthropic egress connector
//!
//! Sends normalized requests to Anthropic-compatible upstreams and parses
//! their responses, including the named SSE event stream, back into the
//! normalized model.

use crate::{auth::ResolvedAuth, EgressError, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use nimbus_core::normalized::{
    FinishReason, Message, MessageContent, NormalizedRequest, NormalizedResponse,
    NormalizedStreamEvent, Role, ToolCall, ToolChoice, Usage,
};
use nimbus_core::provider::{EventStream, Provider};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::pin::Pin;
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic connector for one upstream attempt
pub struct AnthropicConnector {
    client: Client,
    base_url: String,
    auth: ResolvedAuth,
}

impl AnthropicConnector {
    pub fn new(client: Client, base_url: impl Into<String>, auth: ResolvedAuth) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    async fn post(&self, body: serde_json::Value) -> Result<reqwest::Response> {
        let builder = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION);
        let response = self.auth.apply(builder).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_string());
            return Err(EgressError::Provider {
                status_code: status.as_u16(),
                message: body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for AnthropicConnector {
    async fn send(&self, request: NormalizedRequest) -> nimbus_core::Result<NormalizedResponse> {
        debug!(model = %request.model, auth = self.auth.describe(), "sending request to Anthropic upstream");
        let body = to_anthropic_request(&request, false);
        let response = self.post(body).await?;
        let parsed: AnthropicWireResponse = response
            .json()
            .await
            .map_err(|e| EgressError::Parse(format!("invalid Anthropic response: {}", e)))?;
        Ok(from_anthropic_response(parsed))
    }

    async fn stream(&self, request: NormalizedRequest) -> nimbus_core::Result<EventStream> {
        debug!(model = %request.model, auth = self.auth.describe(), "opening Anthropic upstream stream");
        let body = to_anthropic_request(&request, true);
        let response = self.post(body).await?;
        Ok(Box::new(create_anthropic_stream(response)))
    }
}

// Wire types for the upstream side

#[derive(Debug, Clone, Deserialize)]
struct AnthropicWireResponse {
    id: String,
    model: String,
    content: Vec<AnthropicWireContent>,
    stop_reason: Option<String>,
    #[serde(default)]
    stop_sequence: Option<String>,
    usage: AnthropicWireUsage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicWireContent {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct AnthropicWireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Streaming events as sent by Anthropic upstreams
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicWireEvent {
    MessageStart {
        message: AnthropicWireMessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: AnthropicWireBlockStart,
    },
    ContentBlockDelta {
        index: u32,
        delta: AnthropicWireDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: u32,
    },
    MessageDelta {
        delta: AnthropicWireMessageDelta,
        #[serde(default)]
        usage: Option<AnthropicWireUsageDelta>,
    },
    MessageStop,
    Ping,
    Error {
        error: AnthropicWireError,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicWireMessageStart {
    id: String,
    model: String,
    #[serde(default)]
    usage: Option<AnthropicWireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicWireBlockStart {
    Text {
        #[allow(dead_code)]
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicWireDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicWireMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct AnthropicWireUsageDelta {
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicWireError {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

// Conversions

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

/// Build the upstream request body. Tool-role messages fold back into user
/// messages carrying `tool_result` blocks; assistant tool calls become
/// `tool_use` blocks.
fn to_anthropic_request(req: &NormalizedRequest, stream: bool) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = Vec::with_capacity(req.messages.len());

    for msg in &req.messages {
        match msg.role {
            Role::Tool => {
                let block = OutboundBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.content.to_text(),
                    is_error: msg.is_error,
                };
                messages.push(json!({
                    "role": "user",
                    "content": [block],
                }));
            }
            Role::Assistant if !msg.tool_calls.is_empty() => {
                let mut blocks: Vec<OutboundBlock> = Vec::new();
                let text = msg.content.to_text();
                if !text.is_empty() {
                    blocks.push(OutboundBlock::Text { text });
                }
                for call in &msg.tool_calls {
                    let input = serde_json::from_str(&call.arguments)
                        .unwrap_or_else(|_| json!({}));
                    blocks.push(OutboundBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input,
                    });
                }
                messages.push(json!({"role": "assistant", "content": blocks}));
            }
            _ => {
                let role = match msg.role {
                    Role::Assistant => "assistant",
                    // System messages cannot appear mid-conversation on this
                    // wire; fold them into user turns
                    _ => "user",
                };
                messages.push(json!({
                    "role": role,
                    "content": msg.content.to_text(),
                }));
            }
        }
    }

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens.unwrap_or(4096),
        "stream": stream,
    });
    let obj = body.as_object_mut().expect("body is an object");

    if let Some(system) = &req.system {
        obj.insert("system".to_string(), json!(system));
    }
    if let Some(temperature) = req.temperature {
        obj.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = req.top_p {
        obj.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(top_k) = req.top_k {
        obj.insert("top_k".to_string(), json!(top_k));
    }
    if !req.stop_sequences.is_empty() {
        obj.insert("stop_sequences".to_string(), json!(req.stop_sequences));
    }
    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect();
        obj.insert("tools".to_string(), json!(tools));
    }
    if let Some(tc) = &req.tool_choice {
        let value = match tc {
            ToolChoice::Auto => json!({"type": "auto"}),
            ToolChoice::Any => json!({"type": "any"}),
            ToolChoice::Tool { name } => json!({"type": "tool", "name": name}),
            ToolChoice::None => json!({"type": "none"}),
        };
        obj.insert("tool_choice".to_string(), value);
    }
    if let Some(user_id) = req.metadata.get("user_id") {
        obj.insert("metadata".to_string(), json!({"user_id": user_id}));
    }

    body
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "stop_sequence" => FinishReason::StopSequence,
        _ => FinishReason::Stop,
    }
}

fn from_anthropic_response(resp: AnthropicWireResponse) -> NormalizedResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in resp.content {
        match block {
            AnthropicWireContent::Text { text: t } => {
                text.push_str(&t);
            }
            AnthropicWireContent::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                });
            }
            AnthropicWireContent::Unknown => {}
        }
    }

    NormalizedResponse {
        id: resp.id,
        model: resp.model,
        message: Message {
            role: Role::Assistant,
            content: MessageContent::Text(text),
            tool_calls,
            tool_call_id: None,
            is_error: false,
        },
        finish_reason: resp.stop_reason.as_deref().map(map_stop_reason),
        stop_sequence: resp.stop_sequence,
        usage: Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
        },
    }
}

fn create_anthropic_stream(
    response: reqwest::Response,
) -> Pin<Box<dyn Stream<Item = nimbus_core::Result<NormalizedStreamEvent>> + Send>> {
    let event_stream = response.bytes_stream().eventsource();

    let stream = event_stream
        .map(|result| -> Vec<nimbus_core::Result<NormalizedStreamEvent>> {
            match result {
                Ok(event) => match serde_json::from_str::<AnthropicWireEvent>(&event.data) {
                    Ok(wire) => wire_event_to_normalized(wire),
                    Err(e) => vec![Err(nimbus_core::Error::Stream(format!(
                        "failed to parse Anthropic stream event: {}",
                        e
                    )))],
                },
                Err(e) => vec![Err(nimbus_core::Error::Stream(format!(
                    "stream error: {}",
                    e
                )))],
            }
        })
        .flat_map(futures::stream::iter);

    Box::pin(stream)
}

fn wire_event_to_normalized(
    event: AnthropicWireEvent,
) -> Vec<nimbus_core::Result<NormalizedStreamEvent>> {
    match event {
        AnthropicWireEvent::MessageStart { message } => {
            // Usage first, so the downstream encoder already knows the input
            // tokens when it renders message_start
            let mut events = Vec::with_capacity(2);
            if let Some(usage) = message.usage {
                events.push(Ok(NormalizedStreamEvent::Usage {
                    usage: Usage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    },
                }));
            }
            events.push(Ok(NormalizedStreamEvent::Start {
                id: message.id,
                model: message.model,
            }));
            events
        }
        AnthropicWireEvent::ContentBlockStart {
            index,
            content_block,
        } => match content_block {
            AnthropicWireBlockStart::ToolUse { id, name } => {
                vec![Ok(NormalizedStreamEvent::ToolCallDelta {
                    call_index: index,
                    id: Some(id),
                    name: Some(name),
                    arguments: None,
                })]
            }
            AnthropicWireBlockStart::Text { .. } => Vec::new(),
        },
        AnthropicWireEvent::ContentBlockDelta { index, delta } => match delta {
            AnthropicWireDelta::TextDelta { text } => {
                vec![Ok(NormalizedStreamEvent::TextDelta { text })]
            }
            AnthropicWireDelta::InputJsonDelta { partial_json } => {
                vec![Ok(NormalizedStreamEvent::ToolCallDelta {
                    call_index: index,
                    id: None,
                    name: None,
                    arguments: Some(partial_json),
                })]
            }
        },
        AnthropicWireEvent::MessageDelta { delta, usage } => {
            let mut events = Vec::new();
            if let Some(usage) = usage {
                events.push(Ok(NormalizedStreamEvent::Usage {
                    usage: Usage {
                        input_tokens: 0,
                        output_tokens: usage.output_tokens,
                    },
                }));
            }
            if let Some(reason) = delta.stop_reason.as_deref() {
                events.push(Ok(NormalizedStreamEvent::End {
                    finish_reason: map_stop_reason(reason),
                    stop_sequence: delta.stop_sequence,
                }));
            }
            events
        }
        AnthropicWireEvent::Error { error } => {
            vec![Ok(NormalizedStreamEvent::Error {
                error_type: if error.error_type.is_empty() {
                    "api_error".to_string()
                } else {
                    error.error_type
                },
                message: error.message,
            })]
        }
        AnthropicWireEvent::ContentBlockStop { .. }
        | AnthropicWireEvent::MessageStop
        | AnthropicWireEvent::Ping => Vec::new(),
    }
}
