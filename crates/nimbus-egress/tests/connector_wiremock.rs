//! Connector tests against mock upstreams

use futures::StreamExt;
use nimbus_core::normalized::{
    FinishReason, Message, NormalizedRequest, NormalizedStreamEvent, Role,
};
use nimbus_core::provider::Provider;
use nimbus_egress::anthropic::AnthropicConnector;
use nimbus_egress::openai::OpenAIConnector;
use nimbus_egress::{ClientPool, ResolvedAuth};
use std::collections::HashMap;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(model: &str, stream: bool) -> NormalizedRequest {
    NormalizedRequest {
        messages: vec![Message::text(Role::User, "hello upstream")],
        system: Some("be terse".to_string()),
        model: model.to_string(),
        max_tokens: Some(64),
        temperature: None,
        top_p: None,
        top_k: None,
        stop_sequences: vec![],
        stream,
        tools: vec![],
        tool_choice: None,
        metadata: HashMap::new(),
    }
}

#[tokio::test]
async fn openai_send_parses_response_and_sends_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_string_contains("\"model\":\"gpt-4o\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let pool = ClientPool::default();
    let client = pool.get(&server.uri(), None).unwrap();
    let connector = OpenAIConnector::new(
        client,
        server.uri(),
        ResolvedAuth::Bearer("sk-test".to_string()),
    );

    let response = connector.send(request("gpt-4o", false)).await.unwrap();
    assert_eq!(response.message.content.to_text(), "hi");
    assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    assert_eq!(response.usage.input_tokens, 9);
}

#[tokio::test]
async fn openai_error_status_carries_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let pool = ClientPool::default();
    let client = pool.get(&server.uri(), None).unwrap();
    let connector =
        OpenAIConnector::new(client, server.uri(), ResolvedAuth::Bearer("k".to_string()));

    let err = connector.send(request("gpt-4o", false)).await.unwrap_err();
    match err {
        nimbus_core::Error::UpstreamStatus { status, body } => {
            assert_eq!(status, 429);
            assert_eq!(body, "slow down");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn openai_stream_yields_normalized_events() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"one \"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"two\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let pool = ClientPool::default();
    let client = pool.get(&server.uri(), None).unwrap();
    let connector =
        OpenAIConnector::new(client, server.uri(), ResolvedAuth::Bearer("k".to_string()));

    let mut stream = connector.stream(request("gpt-4o", true)).await.unwrap();
    let mut text = String::new();
    let mut saw_end = false;
    while let Some(event) = stream.next().await {
        match event.unwrap() {
            NormalizedStreamEvent::TextDelta { text: t } => text.push_str(&t),
            NormalizedStreamEvent::End { finish_reason, .. } => {
                assert_eq!(finish_reason, FinishReason::Stop);
                saw_end = true;
            }
            _ => {}
        }
    }
    assert_eq!(text, "one two");
    assert!(saw_end);
}

#[tokio::test]
async fn anthropic_send_uses_api_key_and_version_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "bonjour"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 4, "output_tokens": 2}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let pool = ClientPool::default();
    let client = pool.get(&server.uri(), None).unwrap();
    let connector = AnthropicConnector::new(
        client,
        server.uri(),
        ResolvedAuth::ApiKey("sk-ant".to_string()),
    );

    let response = connector
        .send(request("claude-3-5-sonnet-20241022", false))
        .await
        .unwrap();
    assert_eq!(response.message.content.to_text(), "bonjour");
    assert_eq!(response.finish_reason, Some(FinishReason::Stop));
}

#[tokio::test]
async fn anthropic_stream_maps_named_events() {
    let server = MockServer::start().await;
    let body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"m\",\"usage\":{\"input_tokens\":3,\"output_tokens\":0}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"salut\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\",\"stop_sequence\":null},\"usage\":{\"output_tokens\":5}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let pool = ClientPool::default();
    let client = pool.get(&server.uri(), None).unwrap();
    let connector = AnthropicConnector::new(
        client,
        server.uri(),
        ResolvedAuth::ApiKey("k".to_string()),
    );

    let mut stream = connector
        .stream(request("claude-3-5-sonnet-20241022", true))
        .await
        .unwrap();
    let mut saw_start = false;
    let mut text = String::new();
    let mut output_tokens = 0;
    while let Some(event) = stream.next().await {
        match event.unwrap() {
            NormalizedStreamEvent::Start { id, .. } => {
                assert_eq!(id, "msg_1");
                saw_start = true;
            }
            NormalizedStreamEvent::TextDelta { text: t } => text.push_str(&t),
            NormalizedStreamEvent::Usage { usage } if usage.output_tokens > 0 => {
                output_tokens = usage.output_tokens;
            }
            _ => {}
        }
    }
    assert!(saw_start);
    assert_eq!(text, "salut");
    assert_eq!(output_tokens, 5);
}

#[tokio::test]
async fn anthropic_sse_error_event_surfaces_as_error_event() {
    let server = MockServer::start().await;
    let body = "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"busy\"}}\n\n";
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let pool = ClientPool::default();
    let client = pool.get(&server.uri(), None).unwrap();
    let connector = AnthropicConnector::new(
        client,
        server.uri(),
        ResolvedAuth::ApiKey("k".to_string()),
    );

    let mut stream = connector
        .stream(request("claude-3-5-sonnet-20241022", true))
        .await
        .unwrap();
    let first = stream.next().await.unwrap().unwrap();
    match first {
        NormalizedStreamEvent::Error { error_type, .. } => {
            assert_eq!(error_type, "overloaded_error");
        }
        other => panic!("expected error event, got {:?}", other),
    }
}
