//! End-to-end proxy tests against mock upstreams

use nimbus_core::config::{ConfigHandle, ConfigSnapshot};
use nimbus_oauth::{MemoryStore, OAuthConfig, OAuthManager};
use nimbus_server::{build_router, AppState};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn spawn_app(yaml: &str) -> String {
    let snapshot = ConfigSnapshot::from_yaml(yaml).expect("test config parses");
    let oauth = OAuthManager::new(OAuthConfig::default(), Arc::new(MemoryStore::new()));
    let state = AppState::new(ConfigHandle::from_snapshot(snapshot), oauth);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn two_provider_config(primary_url: &str, backup_url: &str, threshold: u32) -> String {
    format!(
        r#"
providers:
  - name: primary
    type: anthropic
    base_url: {primary_url}
    auth_type: api_key
    auth_value: key-primary
  - name: backup
    type: openai
    base_url: {backup_url}
    auth_type: auth_token
    auth_value: key-backup

model_routes:
  "claude-3-5-sonnet-*":
    - provider: primary
      model: passthrough
      priority: 1
    - provider: backup
      model: gpt-4o
      priority: 2
  "claude-3-5-haiku-*":
    - provider: backup
      model: gpt-4o-mini
      priority: 1

settings:
  unhealthy_threshold: {threshold}
  failure_cooldown: 60
  sticky_provider_duration: 0
  request_timeout: 5
  streaming_idle_timeout: 5
  streaming_total_timeout: 30
"#
    )
}

fn messages_body(model: &str, text: &str, stream: bool) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "max_tokens": 128,
        "stream": stream,
        "messages": [{"role": "user", "content": text}],
    })
}

fn openai_success(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-backup-1",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
    })
}

fn anthropic_sse_success(text: &str) -> String {
    [
        r#"event: message_start
data: {"type":"message_start","message":{"id":"msg_up_1","type":"message","role":"assistant","model":"claude-3-5-sonnet-20241022","content":[],"usage":{"input_tokens":4,"output_tokens":0}}}"#.to_string(),
        format!(
            r#"event: content_block_start
data: {{"type":"content_block_start","index":0,"content_block":{{"type":"text","text":""}}}}

event: content_block_delta
data: {{"type":"content_block_delta","index":0,"delta":{{"type":"text_delta","text":"{text}"}}}}

event: content_block_stop
data: {{"type":"content_block_stop","index":0}}

event: message_delta
data: {{"type":"message_delta","delta":{{"stop_reason":"end_turn","stop_sequence":null}},"usage":{{"output_tokens":7}}}}

event: message_stop
data: {{"type":"message_stop"}}

"#
        ),
    ]
    .join("\n\n")
}

async fn provider_entry(base: &str, name: &str) -> serde_json::Value {
    let providers: Vec<serde_json::Value> = reqwest::get(format!("{}/providers", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    providers
        .into_iter()
        .find(|p| p["name"] == name)
        .expect("provider listed")
}

#[tokio::test]
async fn priority_selection_with_failure_falls_back() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .expect(1)
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success("fallback answer")))
        .expect(1)
        .mount(&backup)
        .await;

    let base = spawn_app(&two_provider_config(&primary.uri(), &backup.uri(), 2)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/messages", base))
        .json(&messages_body("claude-3-5-sonnet-20241022", "hello", false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["model"], "claude-3-5-sonnet-20241022");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["text"], "fallback answer");

    // The failed primary accrued one error but is still selectable
    let primary_status = provider_entry(&base, "primary").await;
    assert_eq!(primary_status["error_count"], 1);
    assert_eq!(primary_status["healthy"], true);
}

#[tokio::test]
async fn threshold_marks_unhealthy_and_skips_provider() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;

    // Exactly two calls reach the primary; the third request skips it
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(2)
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success("ok")))
        .expect(3)
        .mount(&backup)
        .await;

    let base = spawn_app(&two_provider_config(&primary.uri(), &backup.uri(), 2)).await;
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let response = client
            .post(format!("{}/v1/messages", base))
            .json(&messages_body("claude-3-5-sonnet-20241022", "hello", false))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let primary_status = provider_entry(&base, "primary").await;
    assert_eq!(primary_status["healthy"], false);
    assert_eq!(primary_status["error_count"], 2);
}

#[tokio::test]
async fn duplicate_unary_requests_share_one_upstream_call() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(openai_success("shared answer"))
                .set_delay(std::time::Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&backup)
        .await;

    let base = spawn_app(&two_provider_config(&primary.uri(), &backup.uri(), 2)).await;
    let client = reqwest::Client::new();
    let body = messages_body("claude-3-5-haiku-20241022", "same question", false);

    let first = {
        let client = client.clone();
        let base = base.clone();
        let body = body.clone();
        tokio::spawn(async move {
            client
                .post(format!("{}/v1/messages", base))
                .json(&body)
                .send()
                .await
                .unwrap()
                .json::<serde_json::Value>()
                .await
                .unwrap()
        })
    };
    // Let the first request take ownership before the duplicate arrives
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let second = {
        let client = client.clone();
        let base = base.clone();
        tokio::spawn(async move {
            client
                .post(format!("{}/v1/messages", base))
                .json(&body)
                .send()
                .await
                .unwrap()
                .json::<serde_json::Value>()
                .await
                .unwrap()
        })
    };

    let (a, b) = (first.await.unwrap(), second.await.unwrap());
    assert_eq!(a["id"], b["id"]);
    assert_eq!(a["content"][0]["text"], "shared answer");
    assert_eq!(b["content"][0]["text"], "shared answer");
}

#[tokio::test]
async fn streaming_early_error_fails_over_before_first_byte() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;

    let error_body = "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"at capacity\"}}\n\n";
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(error_body, "text/event-stream"),
        )
        .expect(1)
        .mount(&primary)
        .await;

    // Backup is Anthropic-shaped for this scenario
    let yaml = format!(
        r#"
providers:
  - name: primary
    type: anthropic
    base_url: {}
    auth_type: api_key
    auth_value: key-primary
  - name: backup
    type: anthropic
    base_url: {}
    auth_type: api_key
    auth_value: key-backup

model_routes:
  "claude-3-5-sonnet-*":
    - provider: primary
      model: passthrough
      priority: 1
    - provider: backup
      model: passthrough
      priority: 2

settings:
  unhealthy_threshold: 2
  sticky_provider_duration: 0
  request_timeout: 5
  streaming_idle_timeout: 5
  streaming_total_timeout: 30
"#,
        primary.uri(),
        backup.uri()
    );

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(anthropic_sse_success("streamed text"), "text/event-stream"),
        )
        .expect(1)
        .mount(&backup)
        .await;

    let base = spawn_app(&yaml).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/messages", base))
        .json(&messages_body("claude-3-5-sonnet-20241022", "stream it", true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let text = response.text().await.unwrap();
    assert!(text.contains("event: message_start"), "got: {}", text);
    assert!(text.contains("streamed text"), "got: {}", text);
    assert!(text.contains("event: message_stop"), "got: {}", text);
    // Nothing from the failed primary leaked downstream
    assert!(!text.contains("at capacity"), "got: {}", text);

    let primary_status = provider_entry(&base, "primary").await;
    assert_eq!(primary_status["error_count"], 1);
}

#[tokio::test]
async fn openai_stream_translates_to_anthropic_events() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;

    let chunks = concat!(
        "data: {\"id\":\"c1\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(chunks, "text/event-stream"))
        .mount(&backup)
        .await;

    let base = spawn_app(&two_provider_config(&primary.uri(), &backup.uri(), 2)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/messages", base))
        .json(&messages_body("claude-3-5-haiku-20241022", "hi", true))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let text = response.text().await.unwrap();
    for event in [
        "event: message_start",
        "event: content_block_start",
        "event: content_block_delta",
        "event: content_block_stop",
        "event: message_delta",
        "event: message_stop",
    ] {
        assert!(text.contains(event), "missing {} in: {}", event, text);
    }
    assert!(text.contains("Hel"), "got: {}", text);
    // The client-requested model is echoed, not the upstream's
    assert!(text.contains("claude-3-5-haiku-20241022"), "got: {}", text);
}

#[tokio::test]
async fn unmatched_model_is_404_and_exhausted_route_is_503() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&primary)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&backup)
        .await;

    // Threshold 1: a single failure marks a provider unhealthy
    let base = spawn_app(&two_provider_config(&primary.uri(), &backup.uri(), 1)).await;
    let client = reqwest::Client::new();

    // No route at all
    let response = client
        .post(format!("{}/v1/messages", base))
        .json(&messages_body("gpt-4o", "hi", false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "not_found_error");

    // Route exists; both candidates fail and get marked
    let response = client
        .post(format!("{}/v1/messages", base))
        .json(&messages_body("claude-3-5-sonnet-20241022", "hi", false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    // Now every candidate is cooling down
    let response = client
        .post(format!("{}/v1/messages", base))
        .json(&messages_body("claude-3-5-sonnet-20241022", "hi", false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("unavailable"));
}

#[tokio::test]
async fn auth_gate_rejects_and_accepts() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_success("hi")))
        .mount(&backup)
        .await;

    let yaml = format!(
        "{}\n  auth:\n    enabled: true\n    api_key: sekrit\n",
        two_provider_config(&primary.uri(), &backup.uri(), 2)
    );
    let base = spawn_app(&yaml).await;
    let client = reqwest::Client::new();

    // Missing key
    let response = client
        .post(format!("{}/v1/messages", base))
        .json(&messages_body("claude-3-5-haiku-20241022", "hi", false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "authentication_error");

    // Exempt path works without a key
    let response = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(response.status(), 200);

    // Correct key passes through to the upstream
    let response = client
        .post(format!("{}/v1/messages", base))
        .header("x-api-key", "sekrit")
        .json(&messages_body("claude-3-5-haiku-20241022", "hi", false))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn count_tokens_returns_estimate() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    let base = spawn_app(&two_provider_config(&primary.uri(), &backup.uri(), 2)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/v1/messages/count_tokens", base))
        .json(&messages_body(
            "claude-3-5-sonnet-20241022",
            "count the tokens in this sentence please",
            false,
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["input_tokens"].as_u64().unwrap() > 0);
}
