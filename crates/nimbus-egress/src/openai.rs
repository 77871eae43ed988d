//! OpenAI egress connector
//!
//! Translates normalized requests into the chat-completions dialect and
//! OpenAI responses (unary and streaming) back into the normalized model.
//! Tool calls coming back from OpenAI receive fresh `toolu_*` ids so the
//! client always sees Anthropic-shaped identifiers; within a request the ids
//! only need to be self-consistent, so the replacement survives the next
//! round trip.

use crate::{auth::ResolvedAuth, EgressError};
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
use std::pin::Pin;
use tracing::debug;
use uuid::Uuid;

/// OpenAI connector for one upstream attempt
pub struct OpenAIConnector {
    client: Client,
    base_url: String,
    auth: ResolvedAuth,
}

impl OpenAIConnector {
    pub fn new(client: Client, base_url: impl Into<String>, auth: ResolvedAuth) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl Provider for OpenAIConnector {
    async fn send(&self, request: NormalizedRequest) -> nimbus_core::Result<NormalizedResponse> {
        debug!(model = %request.model, auth = self.auth.describe(), "sending request to OpenAI upstream");
        let openai_req = to_openai_request(&request);

        let builder = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json");
        let response = self
            .auth
            .apply(builder)
            .json(&openai_req)
            .send()
            .await
            .map_err(EgressError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_string());
            return Err(EgressError::Provider {
                status_code: status.as_u16(),
                message: body,
            }
            .into());
        }

        let parsed: OpenAIChatResponse = response
            .json()
            .await
            .map_err(|e| EgressError::Parse(format!("invalid OpenAI response: {}", e)))?;
        Ok(from_openai_response(parsed))
    }

    async fn stream(&self, request: NormalizedRequest) -> nimbus_core::Result<EventStream> {
        debug!(model = %request.model, auth = self.auth.describe(), "opening OpenAI upstream stream");
        let mut openai_req = to_openai_request(&request);
        openai_req.stream = Some(true);
        openai_req.stream_options = Some(OpenAIStreamOptions {
            include_usage: true,
        });

        let builder = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json");
        let response = self
            .auth
            .apply(builder)
            .json(&openai_req)
            .send()
            .await
            .map_err(EgressError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_string());
            return Err(EgressError::Provider {
                status_code: status.as_u16(),
                message: body,
            }
            .into());
        }

        Ok(Box::new(create_openai_stream(response)))
    }
}

// OpenAI wire types (the subset this proxy speaks)

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    /// Newer reasoning models reject max_tokens in favor of this field
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAIStreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<OpenAIToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAIStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAIFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAIFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum OpenAIToolChoice {
    Mode(String),
    Function {
        #[serde(rename = "type")]
        choice_type: String,
        function: OpenAIFunctionName,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAIFunctionName {
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAIChatResponse {
    id: String,
    model: String,
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAIToolCall>>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAIDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAIToolCallDelta>>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAIToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAIFunctionCallDelta>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAIFunctionCallDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

// Conversions

fn to_openai_request(req: &NormalizedRequest) -> OpenAIChatRequest {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);

    if let Some(system) = &req.system {
        messages.push(OpenAIMessage {
            role: "system".to_string(),
            content: Some(system.clone()),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for msg in &req.messages {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
        .to_string();

        let mut text = msg.content.to_text();
        if msg.is_error && msg.role == Role::Tool {
            text = format!("Error: {}", text);
        }
        let content = if text.is_empty() && !msg.tool_calls.is_empty() {
            // OpenAI expects null content on pure tool-call messages
            None
        } else {
            Some(text)
        };

        let tool_calls = if msg.tool_calls.is_empty() {
            None
        } else {
            Some(
                msg.tool_calls
                    .iter()
                    .map(|call| OpenAIToolCall {
                        id: call.id.clone(),
                        tool_type: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect(),
            )
        };

        messages.push(OpenAIMessage {
            role,
            content,
            tool_calls,
            tool_call_id: msg.tool_call_id.clone(),
        });
    }

    let tools = if req.tools.is_empty() {
        None
    } else {
        Some(
            req.tools
                .iter()
                .map(|tool| OpenAITool {
                    tool_type: "function".to_string(),
                    function: OpenAIFunction {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                    },
                })
                .collect(),
        )
    };

    let tool_choice = req.tool_choice.as_ref().map(|tc| match tc {
        ToolChoice::Auto => OpenAIToolChoice::Mode("auto".to_string()),
        ToolChoice::Any => OpenAIToolChoice::Mode("required".to_string()),
        ToolChoice::None => OpenAIToolChoice::Mode("none".to_string()),
        ToolChoice::Tool { name } => OpenAIToolChoice::Function {
            choice_type: "function".to_string(),
            function: OpenAIFunctionName { name: name.clone() },
        },
    });

    // Reasoning-model families only accept max_completion_tokens
    let uses_completion_tokens = req.model.starts_with("gpt-5")
        || req.model.starts_with("o1")
        || req.model.starts_with("o3");
    let (max_tokens, max_completion_tokens) = if uses_completion_tokens {
        (None, req.max_tokens)
    } else {
        (req.max_tokens, None)
    };

    let user = req
        .metadata
        .get("user_id")
        .and_then(|v| v.as_str())
        .map(String::from);

    OpenAIChatRequest {
        model: req.model.clone(),
        messages,
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens,
        max_completion_tokens,
        stream: None,
        stream_options: None,
        stop: if req.stop_sequences.is_empty() {
            None
        } else {
            Some(req.stop_sequences.clone())
        },
        tools,
        tool_choice,
        user,
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn fresh_tool_id() -> String {
    format!("toolu_{}", Uuid::new_v4().simple())
}

fn from_openai_response(resp: OpenAIChatResponse) -> NormalizedResponse {
    let (message, finish_reason) = resp
        .choices
        .into_iter()
        .next()
        .map(|choice| {
            let tool_calls = choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|call| {
                    let OpenAIFunctionCall { name, arguments } = call.function;
                    ToolCall {
                        id: fresh_tool_id(),
                        name,
                        arguments: if arguments.is_empty() {
                            "{}".to_string()
                        } else {
                            arguments
                        },
                    }
                })
                .collect::<Vec<_>>();
            let finish = choice.finish_reason.as_deref().map(map_finish_reason);
            (
                Message {
                    role: Role::Assistant,
                    content: MessageContent::Text(choice.message.content.unwrap_or_default()),
                    tool_calls,
                    tool_call_id: None,
                    is_error: false,
                },
                finish,
            )
        })
        .unwrap_or_else(|| (Message::text(Role::Assistant, ""), None));

    let usage = resp
        .usage
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    NormalizedResponse {
        id: resp.id,
        model: resp.model,
        message,
        finish_reason,
        stop_sequence: None,
        usage,
    }
}

/// Parse an OpenAI SSE body into normalized events.
fn create_openai_stream(
    response: reqwest::Response,
) -> Pin<Box<dyn Stream<Item = nimbus_core::Result<NormalizedStreamEvent>> + Send>> {
    let event_stream = response.bytes_stream().eventsource();

    let stream = event_stream
        .map(|result| -> Vec<nimbus_core::Result<NormalizedStreamEvent>> {
            match result {
                Ok(event) => {
                    // [DONE] is a sentinel; End is emitted with finish_reason
                    if event.data.trim() == "[DONE]" {
                        return Vec::new();
                    }
                    match serde_json::from_str::<OpenAIStreamChunk>(&event.data) {
                        Ok(chunk) => chunk_to_events(chunk),
                        Err(e) => vec![Err(nimbus_core::Error::Stream(format!(
                            "failed to parse OpenAI stream chunk: {}",
                            e
                        )))],
                    }
                }
                Err(e) => vec![Err(nimbus_core::Error::Stream(format!(
                    "stream error: {}",
                    e
                )))],
            }
        })
        .flat_map(futures::stream::iter);

    Box::pin(stream)
}

fn chunk_to_events(chunk: OpenAIStreamChunk) -> Vec<nimbus_core::Result<NormalizedStreamEvent>> {
    let mut events = Vec::new();

    if let Some(usage) = chunk.usage {
        events.push(Ok(NormalizedStreamEvent::Usage {
            usage: Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
        }));
    }

    let Some(choice) = chunk.choices.into_iter().next() else {
        return events;
    };

    if let Some(content) = choice.delta.content {
        if !content.is_empty() {
            events.push(Ok(NormalizedStreamEvent::TextDelta { text: content }));
        }
    }

    for call in choice.delta.tool_calls.unwrap_or_default() {
        let (name, arguments) = match call.function {
            Some(f) => (f.name, f.arguments),
            None => (None, None),
        };
        events.push(Ok(NormalizedStreamEvent::ToolCallDelta {
            call_index: call.index,
            // The first fragment of each call carries the upstream id;
            // replace it with an Anthropic-shaped one right away.
            id: call.id.map(|_| fresh_tool_id()),
            name,
            arguments,
        }));
    }

    if let Some(reason) = choice.finish_reason {
        events.push(Ok(NormalizedStreamEvent::End {
            finish_reason: map_finish_reason(&reason),
            stop_sequence: None,
        }));
    }

    if events.is_empty() {
        tracing::trace!(chunk_id = %chunk.id, model = %chunk.model, "chunk carried no actionable delta");
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request_with(messages: Vec<Message>) -> NormalizedRequest {
        NormalizedRequest {
            messages,
            system: Some("Be helpful".to_string()),
            model: "gpt-4o".to_string(),
            max_tokens: Some(512),
            temperature: Some(0.5),
            top_p: None,
            top_k: Some(40),
            stop_sequences: vec!["STOP".to_string()],
            stream: false,
            tools: vec![],
            tool_choice: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_system_becomes_first_message() {
        let req = request_with(vec![Message::text(Role::User, "hi")]);
        let openai = to_openai_request(&req);
        assert_eq!(openai.messages[0].role, "system");
        assert_eq!(openai.messages[0].content, Some("Be helpful".to_string()));
        assert_eq!(openai.messages[1].role, "user");
    }

    #[test]
    fn test_top_k_dropped_and_stop_mapped() {
        let req = request_with(vec![Message::text(Role::User, "hi")]);
        let openai = to_openai_request(&req);
        assert_eq!(openai.stop, Some(vec!["STOP".to_string()]));
        // top_k has no OpenAI equivalent; the request type has no field for
        // it, so serialization cannot leak it
        let json = serde_json::to_value(&openai).unwrap();
        assert!(json.get("top_k").is_none());
    }

    #[test]
    fn test_tool_result_message_maps_to_tool_role() {
        let req = request_with(vec![Message {
            role: Role::Tool,
            content: MessageContent::Text("72 degrees".to_string()),
            tool_calls: vec![],
            tool_call_id: Some("toolu_9".to_string()),
            is_error: false,
        }]);
        let openai = to_openai_request(&req);
        let tool_msg = &openai.messages[1];
        assert_eq!(tool_msg.role, "tool");
        assert_eq!(tool_msg.tool_call_id, Some("toolu_9".to_string()));
        assert_eq!(tool_msg.content, Some("72 degrees".to_string()));
    }

    #[test]
    fn test_tool_error_result_prefixed() {
        let req = request_with(vec![Message {
            role: Role::Tool,
            content: MessageContent::Text("timeout".to_string()),
            tool_calls: vec![],
            tool_call_id: Some("toolu_9".to_string()),
            is_error: true,
        }]);
        let openai = to_openai_request(&req);
        assert_eq!(openai.messages[1].content, Some("Error: timeout".to_string()));
    }

    #[test]
    fn test_assistant_tool_calls_have_null_content() {
        let req = request_with(vec![Message {
            role: Role::Assistant,
            content: MessageContent::Text(String::new()),
            tool_calls: vec![ToolCall {
                id: "toolu_1".to_string(),
                name: "lookup".to_string(),
                arguments: "{}".to_string(),
            }],
            tool_call_id: None,
            is_error: false,
        }]);
        let openai = to_openai_request(&req);
        assert_eq!(openai.messages[1].content, None);
        assert_eq!(openai.messages[1].tool_calls.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_tool_choice_mapping() {
        let mut req = request_with(vec![Message::text(Role::User, "hi")]);
        req.tool_choice = Some(ToolChoice::Tool {
            name: "search".to_string(),
        });
        let openai = to_openai_request(&req);
        match openai.tool_choice.unwrap() {
            OpenAIToolChoice::Function { function, .. } => assert_eq!(function.name, "search"),
            other => panic!("expected function choice, got {:?}", other),
        }
    }

    #[test]
    fn test_reasoning_models_use_max_completion_tokens() {
        let mut req = request_with(vec![Message::text(Role::User, "hi")]);
        req.model = "o1-preview".to_string();
        let openai = to_openai_request(&req);
        assert_eq!(openai.max_tokens, None);
        assert_eq!(openai.max_completion_tokens, Some(512));
    }

    #[test]
    fn test_user_id_maps_to_user() {
        let mut req = request_with(vec![Message::text(Role::User, "hi")]);
        req.metadata
            .insert("user_id".to_string(), serde_json::json!("u-42"));
        let openai = to_openai_request(&req);
        assert_eq!(openai.user, Some("u-42".to_string()));
    }

    #[test]
    fn test_from_openai_response_tool_calls_get_toolu_ids() {
        let resp = OpenAIChatResponse {
            id: "chatcmpl-1".to_string(),
            model: "gpt-4o".to_string(),
            choices: vec![OpenAIChoice {
                message: OpenAIResponseMessage {
                    content: None,
                    tool_calls: Some(vec![OpenAIToolCall {
                        id: "call_abc".to_string(),
                        tool_type: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: "get_weather".to_string(),
                            arguments: r#"{"location":"Paris"}"#.to_string(),
                        },
                    }]),
                },
                finish_reason: Some("tool_calls".to_string()),
            }],
            usage: Some(OpenAIUsage {
                prompt_tokens: 10,
                completion_tokens: 7,
            }),
        };

        let normalized = from_openai_response(resp);
        assert_eq!(normalized.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(normalized.message.tool_calls.len(), 1);
        assert!(normalized.message.tool_calls[0].id.starts_with("toolu_"));
        assert_eq!(normalized.message.tool_calls[0].name, "get_weather");
        assert_eq!(normalized.usage.input_tokens, 10);
        assert_eq!(normalized.usage.output_tokens, 7);
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("stop"), FinishReason::Stop);
        assert_eq!(map_finish_reason("length"), FinishReason::Length);
        assert_eq!(map_finish_reason("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(map_finish_reason("function_call"), FinishReason::ToolCalls);
        assert_eq!(map_finish_reason("content_filter"), FinishReason::ContentFilter);
    }

    #[test]
    fn test_chunk_with_text_delta() {
        let chunk: OpenAIStreamChunk = serde_json::from_str(
            r#"{"id":"c1","model":"gpt-4o","choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
        )
        .unwrap();
        let events = chunk_to_events(chunk);
        assert_eq!(events.len(), 1);
        match events[0].as_ref().unwrap() {
            NormalizedStreamEvent::TextDelta { text } => assert_eq!(text, "Hel"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_chunk_with_multiple_tool_calls() {
        let chunk: OpenAIStreamChunk = serde_json::from_str(
            r#"{"id":"c1","choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"call_a","function":{"name":"first","arguments":""}},
                {"index":1,"id":"call_b","function":{"name":"second","arguments":""}}
            ]},"finish_reason":null}]}"#,
        )
        .unwrap();
        let events = chunk_to_events(chunk);
        assert_eq!(events.len(), 2);
        for (i, event) in events.iter().enumerate() {
            match event.as_ref().unwrap() {
                NormalizedStreamEvent::ToolCallDelta {
                    call_index, id, ..
                } => {
                    assert_eq!(*call_index, i as u32);
                    assert!(id.as_ref().unwrap().starts_with("toolu_"));
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_chunk_with_finish_reason() {
        let chunk: OpenAIStreamChunk = serde_json::from_str(
            r#"{"id":"c1","choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        )
        .unwrap();
        let events = chunk_to_events(chunk);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            NormalizedStreamEvent::End {
                finish_reason: FinishReason::Stop,
                ..
            }
        ));
    }

    #[test]
    fn test_usage_chunk() {
        let chunk: OpenAIStreamChunk = serde_json::from_str(
            r#"{"id":"c1","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":9}}"#,
        )
        .unwrap();
        let events = chunk_to_events(chunk);
        match events[0].as_ref().unwrap() {
            NormalizedStreamEvent::Usage { usage } => {
                assert_eq!(usage.input_tokens, 5);
                assert_eq!(usage.output_tokens, 9);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
