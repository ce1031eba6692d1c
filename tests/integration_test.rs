use bytes::Bytes;
use futures::StreamExt;
use llm_relay::metrics::{LifecycleEvent, MemoryMetrics};
use llm_relay::translate::Dialect;
use llm_relay::{ConfigHierarchy, Gateway, GatewayError, GatewayResponse, InboundRequest};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn gateway_with(files: Vec<PathBuf>, pairs: &[(&str, &str)]) -> (Gateway, Arc<MemoryMetrics>) {
    let metrics = Arc::new(MemoryMetrics::default());
    let gateway = Gateway::new(
        Arc::new(ConfigHierarchy::new(files, env(pairs))),
        metrics.clone(),
    )
    .unwrap();
    (gateway, metrics)
}

fn chat_completion(model: &str, text: &str) -> Value {
    json!({
        "id": "chatcmpl-abc",
        "object": "chat.completion",
        "created": 1,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
    })
}

fn openai_request(model: &str) -> InboundRequest {
    let body = json!({
        "model": model,
        "messages": [{"role": "user", "content": "ping"}]
    });
    InboundRequest::new(Dialect::OpenAi, body.to_string())
}

fn anthropic_request(model: &str, stream: bool) -> InboundRequest {
    let body = json!({
        "model": model,
        "max_tokens": 64,
        "stream": stream,
        "system": "Be brief.",
        "messages": [{"role": "user", "content": "ping"}]
    });
    InboundRequest::new(Dialect::Anthropic, body.to_string())
}

fn json_body(response: GatewayResponse) -> (u16, Value) {
    match response {
        GatewayResponse::Json { status, body } => (status, body),
        GatewayResponse::Stream(_) => panic!("expected a JSON response"),
    }
}

async fn stream_text(response: GatewayResponse) -> String {
    let GatewayResponse::Stream(stream) = response else {
        panic!("expected a stream");
    };
    let parts: Vec<Bytes> = stream.map(|r| r.unwrap()).collect().await;
    parts
        .iter()
        .map(|b| String::from_utf8_lossy(b).to_string())
        .collect()
}

#[tokio::test]
async fn test_key_rotation_round_robin() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("gpt-4o", "pong")))
        .expect(3)
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![],
        &[("OPENAI_API_KEY", "k1 k2"), ("OPENAI_BASE_URL", server.uri().as_str())],
    );
    for _ in 0..3 {
        gateway.handle(openai_request("gpt-4o")).await.unwrap();
    }

    let auth: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.headers.get("authorization").unwrap().to_str().unwrap().to_string())
        .collect();
    assert_eq!(auth, ["Bearer k1", "Bearer k2", "Bearer k1"]);
}

#[tokio::test]
async fn test_explicit_provider_prefix_resolves_alias() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("gpt-4o-mini", "pong")))
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, metrics) = gateway_with(
        vec![],
        &[
            ("OPENAI_API_KEY", "sk-1"),
            ("OPENAI_BASE_URL", server.uri().as_str()),
            ("OPENAI_ALIAS_HAIKU", "gpt-4o-mini"),
        ],
    );
    let (status, body) = json_body(gateway.handle(openai_request("openai:haiku")).await.unwrap());
    assert_eq!(status, 200);
    // the client sees the model it asked for
    assert_eq!(body["model"], "openai:haiku");

    let events = metrics.events();
    assert!(events.iter().any(|(_, e)| matches!(
        e,
        LifecycleEvent::SelectionComplete { provider, model, .. } if provider == "openai" && model == "gpt-4o-mini"
    )));
    assert!(events.iter().any(|(_, e)| matches!(
        e,
        LifecycleEvent::UpstreamComplete { input_tokens: 7, output_tokens: 3, .. }
    )));
}

#[tokio::test]
async fn test_passthrough_without_client_key_never_calls_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("glm", "pong")))
        .expect(0)
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![],
        &[("ZAI_API_KEY", "!PASSTHRU"), ("ZAI_BASE_URL", server.uri().as_str())],
    );
    let err = gateway.handle(openai_request("zai:glm-4.6")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Auth { ref provider } if provider == "zai"));
    assert_eq!(err.status_code(), 401);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_passthrough_forwards_client_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer client-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("glm-4.6", "pong")))
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![],
        &[("ZAI_API_KEY", "!PASSTHRU"), ("ZAI_BASE_URL", server.uri().as_str())],
    );
    let request = openai_request("zai:glm-4.6").with_client_key("client-secret");
    let (status, _) = json_body(gateway.handle(request).await.unwrap());
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_rejected_key_is_retried_once_with_next_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer bad"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "invalid key", "type": "invalid_request_error"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer good"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("gpt-4o", "pong")))
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, metrics) = gateway_with(
        vec![],
        &[("OPENAI_API_KEY", "bad good"), ("OPENAI_BASE_URL", server.uri().as_str())],
    );
    let (status, _) = json_body(gateway.handle(openai_request("gpt-4o")).await.unwrap());
    assert_eq!(status, 200);

    let attempts: Vec<u32> = metrics
        .events()
        .into_iter()
        .filter_map(|(_, e)| match e {
            LifecycleEvent::UpstreamStart { attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, [1, 2]);
}

#[tokio::test]
async fn test_single_key_401_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "invalid key", "type": "invalid_request_error"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![],
        &[("OPENAI_API_KEY", "only"), ("OPENAI_BASE_URL", server.uri().as_str())],
    );
    let (status, body) = json_body(gateway.handle(openai_request("gpt-4o")).await.unwrap());
    assert_eq!(status, 401);
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["message"], "invalid key");
}

#[tokio::test]
async fn test_upstream_rate_limit_maps_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "slow down", "type": "requests", "code": "rate_limit_exceeded"}
        })))
        .mount(&server)
        .await;

    let (gateway, metrics) = gateway_with(
        vec![],
        &[("OPENAI_API_KEY", "sk-1"), ("OPENAI_BASE_URL", server.uri().as_str())],
    );
    let (status, body) = json_body(gateway.handle(anthropic_request("gpt-4o", false)).await.unwrap());
    assert_eq!(status, 429);
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert!(metrics
        .events()
        .iter()
        .any(|(_, e)| matches!(e, LifecycleEvent::UpstreamFailed { status: 429, .. })));
}

#[tokio::test]
async fn test_anthropic_client_through_openai_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini", "max_tokens": 64})))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("gpt-4o-mini", "pong")))
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![],
        &[("OPENAI_API_KEY", "sk-1"), ("OPENAI_BASE_URL", server.uri().as_str())],
    );
    let (status, body) = json_body(gateway.handle(anthropic_request("gpt-4o-mini", false)).await.unwrap());
    assert_eq!(status, 200);
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["type"], "text");
    assert_eq!(body["content"][0]["text"], "pong");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 7);

    let sent: Value = server.received_requests().await.unwrap()[0].body_json().unwrap();
    assert_eq!(sent["messages"][0]["role"], "system");
    assert_eq!(sent["messages"][1]["role"], "user");
}

#[tokio::test]
async fn test_openai_client_through_anthropic_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({"model": "claude-haiku-4-5", "max_tokens": 4096})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-haiku-4-5",
            "content": [{"type": "text", "text": "pong"}],
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "usage": {"input_tokens": 4, "output_tokens": 1}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![],
        &[("ANTHROPIC_API_KEY", "sk-ant"), ("ANTHROPIC_BASE_URL", server.uri().as_str())],
    );
    let (status, body) =
        json_body(gateway.handle(openai_request("anthropic:claude-haiku-4-5")).await.unwrap());
    assert_eq!(status, 200);
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "pong");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 4);
}

#[tokio::test]
async fn test_same_dialect_keeps_unknown_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"model": "gpt-4o", "logit_bias": {"50256": -100}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("gpt-4o", "pong")))
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![],
        &[("OPENAI_API_KEY", "sk-1"), ("OPENAI_BASE_URL", server.uri().as_str())],
    );
    let body = json!({
        "model": "gpt-4o",
        "logit_bias": {"50256": -100},
        "messages": [{"role": "user", "content": "ping"}]
    });
    let request = InboundRequest::new(Dialect::OpenAi, body.to_string());
    let (status, _) = json_body(gateway.handle(request).await.unwrap());
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_streaming_openai_upstream_to_anthropic_client() {
    let sse = [
        r#"data: {"id":"chatcmpl-1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"},"finish_reason":null}]}"#,
        r#"data: {"id":"chatcmpl-1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":null}]}"#,
        r#"data: {"id":"chatcmpl-1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        r#"data: {"id":"chatcmpl-1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
        "data: [DONE]",
    ]
    .join("\n\n")
        + "\n\n";

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, metrics) = gateway_with(
        vec![],
        &[("OPENAI_API_KEY", "sk-1"), ("OPENAI_BASE_URL", server.uri().as_str())],
    );
    let out = stream_text(gateway.handle(anthropic_request("gpt-4o", true)).await.unwrap()).await;

    assert!(out.starts_with("event: message_start"));
    assert!(out.contains("\"text\":\"Hel\""));
    assert!(out.contains("\"text\":\"lo\""));
    assert!(out.contains("\"stop_reason\":\"end_turn\""));
    assert_eq!(out.matches("event: message_stop").count(), 1);
    assert!(out.ends_with("data: [DONE]\n\n"));

    assert!(metrics.events().iter().any(|(_, e)| matches!(
        e,
        LifecycleEvent::StreamClosed { input_tokens: 5, output_tokens: 2, errored: false, .. }
    )));
}

#[tokio::test]
async fn test_streaming_error_status_is_plain_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![],
        &[("OPENAI_API_KEY", "sk-1"), ("OPENAI_BASE_URL", server.uri().as_str())],
    );
    let (status, body) = json_body(gateway.handle(anthropic_request("gpt-4o", true)).await.unwrap());
    assert_eq!(status, 503);
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "api_error");
}

#[tokio::test]
async fn test_unknown_provider_prefix() {
    let (gateway, _) = gateway_with(vec![], &[("OPENAI_API_KEY", "sk-1")]);
    // groq is a bundled preset with no key in this environment
    let err = gateway.handle(openai_request("groq:llama")).await.unwrap_err();
    assert!(matches!(err, GatewayError::UnknownProvider { .. }));
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn test_reload_picks_up_new_alias() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("llm-relay.toml");
    std::fs::write(&file, "[providers.openai.aliases]\nfast = \"gpt-4o-mini\"\n").unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("x", "pong")))
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![file.clone()],
        &[("OPENAI_API_KEY", "sk-1"), ("OPENAI_BASE_URL", server.uri().as_str())],
    );
    gateway.handle(openai_request("fast")).await.unwrap();

    std::fs::write(&file, "[providers.openai.aliases]\nfast = \"gpt-4.1\"\n").unwrap();
    let summary = gateway.reload().unwrap();
    assert_eq!(summary["generation"], 1);
    gateway.handle(openai_request("fast")).await.unwrap();

    let models: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.body_json::<Value>().unwrap()["model"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(models, ["gpt-4o-mini", "gpt-4.1"]);
}

#[tokio::test]
async fn test_count_tokens_estimate_for_openai_provider() {
    let (gateway, _) = gateway_with(vec![], &[("OPENAI_API_KEY", "sk-1")]);
    let body = json!({
        "model": "gpt-4o",
        "max_tokens": 10,
        "messages": [{"role": "user", "content": "12345678"}]
    });
    let (status, json) = json_body(
        gateway
            .count_tokens(Bytes::from(body.to_string()), None)
            .await
            .unwrap(),
    );
    assert_eq!(status, 200);
    assert_eq!(json["input_tokens"], 2);
}

#[tokio::test]
async fn test_list_models_prefixes_provider() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [{"id": "gpt-4o", "object": "model", "owned_by": "openai"}]
        })))
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![],
        &[("OPENAI_API_KEY", "sk-1"), ("OPENAI_BASE_URL", server.uri().as_str())],
    );
    let models = gateway.list_models(None).await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].id, "openai:gpt-4o");
}

#[tokio::test]
async fn test_list_models_leaves_key_rotation_alone() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"object": "list", "data": []})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("gpt-4o", "pong")))
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![],
        &[("OPENAI_API_KEY", "k1 k2"), ("OPENAI_BASE_URL", server.uri().as_str())],
    );
    gateway.handle(openai_request("gpt-4o")).await.unwrap();
    gateway.list_models(None).await.unwrap();
    gateway.handle(openai_request("gpt-4o")).await.unwrap();

    let chat_auth: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.to_string() == "POST")
        .map(|r| r.headers.get("authorization").unwrap().to_str().unwrap().to_string())
        .collect();
    assert_eq!(chat_auth, ["Bearer k1", "Bearer k2"]);
}

#[tokio::test]
async fn test_streaming_response_headers_are_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("data: [DONE]\n\n", "text/event-stream")
                .set_delay(std::time::Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![],
        &[
            ("OPENAI_API_KEY", "sk-1"),
            ("OPENAI_BASE_URL", server.uri().as_str()),
            ("STREAMING_READ_TIMEOUT", "1"),
        ],
    );
    let started = std::time::Instant::now();
    let err = gateway.handle(anthropic_request("gpt-4o", true)).await.unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamTimeout { .. }));
    assert!(started.elapsed() < std::time::Duration::from_secs(3));
}

#[tokio::test]
async fn test_anthropic_same_dialect_forwards_unmodelled_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "ak-1"))
        .and(body_partial_json(json!({
            "model": "claude-x",
            "messages": [{"role": "user", "content": [{"type": "document", "source": {"type": "text", "media_type": "text/plain", "data": "notes"}}]}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-x",
            "content": [{"type": "text", "text": "read it"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 9, "output_tokens": 2}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![],
        &[("ANTHROPIC_API_KEY", "ak-1"), ("ANTHROPIC_BASE_URL", server.uri().as_str())],
    );
    let body = json!({
        "model": "anthropic:claude-x",
        "max_tokens": 64,
        "messages": [{"role": "user", "content": [{"type": "document", "source": {"type": "text", "media_type": "text/plain", "data": "notes"}}]}]
    });
    let request = InboundRequest::new(Dialect::Anthropic, body.to_string());
    let (status, body) = json_body(gateway.handle(request).await.unwrap());
    assert_eq!(status, 200);
    assert_eq!(body["content"][0]["text"], "read it");
}

#[tokio::test]
async fn test_anthropic_passthrough_stream_ends_with_done() {
    let sse = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"claude-x\",\"content\":[],\"usage\":{\"input_tokens\":3,\"output_tokens\":0}}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![],
        &[("ANTHROPIC_API_KEY", "ak-1"), ("ANTHROPIC_BASE_URL", server.uri().as_str())],
    );
    let out = stream_text(gateway.handle(anthropic_request("anthropic:claude-x", true)).await.unwrap()).await;
    assert!(out.starts_with("event: message_start"));
    assert!(out.ends_with("data: [DONE]\n\n"));
    assert_eq!(out.matches("[DONE]").count(), 1);
}

#[tokio::test]
async fn test_profile_alias_routes_with_profile_timeout() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("llm-relay.toml");
    std::fs::write(
        &file,
        "[\"#snappy\"]\ntimeout = 1\n\n[\"#snappy\".aliases]\nhaiku = \"openai:gpt-4o-mini\"\n",
    )
    .unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(chat_completion("gpt-4o-mini", "late"))
                .set_delay(std::time::Duration::from_secs(3)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, metrics) = gateway_with(
        vec![file],
        &[("OPENAI_API_KEY", "sk-1"), ("OPENAI_BASE_URL", server.uri().as_str())],
    );
    let started = std::time::Instant::now();
    let err = gateway.handle(openai_request("snappy:haiku")).await.unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamTimeout { .. }));
    assert!(started.elapsed() < std::time::Duration::from_secs(3));
    assert!(metrics.events().iter().any(|(_, e)| matches!(
        e,
        LifecycleEvent::SelectionComplete { provider, model, .. } if provider == "openai" && model == "gpt-4o-mini"
    )));

    let aliases = gateway.list_aliases().unwrap();
    assert_eq!(aliases["profiles"]["snappy"]["timeout"], 1);
    assert_eq!(aliases["profiles"]["snappy"]["aliases"]["haiku"], "openai:gpt-4o-mini");
}

#[tokio::test]
async fn test_full_server_roundtrip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion("gpt-4o", "pong")))
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(
        vec![],
        &[("OPENAI_API_KEY", "sk-1"), ("OPENAI_BASE_URL", server.uri().as_str())],
    );
    let state = Arc::new(llm_relay::AppState {
        gateway: Arc::new(gateway),
    });
    let app = llm_relay::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();

    let health = client.get(format!("http://{addr}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let response = client
        .post(format!("http://{addr}/v1/messages"))
        .json(&json!({
            "model": "gpt-4o",
            "max_tokens": 30,
            "messages": [{"role": "user", "content": "Say 'pong'"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(body["content"][0]["text"], "pong");

    let aliases: Value = client
        .get(format!("http://{addr}/v1/aliases"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(aliases["default_provider"], "openai");

    let bad = client
        .post(format!("http://{addr}/v1/chat/completions"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);
    let body: Value = bad.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
}
