use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use httpmock::prelude::*;
use serde_json::json;
use tower::ServiceExt;

use costgate::config::{CandidateConfig, Config, ModelConfig, ProviderConfig, ProviderKind};
use costgate::gateway::UsageSink;
use costgate::server::{router, AppState};
use costgate::storage::{SqliteStore, Store, UsageQuery, UsageRecord};
use costgate::Gateway;

fn base_config() -> Config {
    Config {
        listen: "127.0.0.1:0".to_string(),
        api_keys: Vec::new(),
        providers: Vec::new(),
        models: Vec::new(),
        default_provider: String::new(),
        debug: false,
        save_usage: true,
        storage_type: "sqlite".to_string(),
        storage_uri: "usage.db".to_string(),
        retention_days: 3,
        cleanup_interval_hours: 6,
        cleanup_enabled: false,
    }
}

async fn build_app(config: &Config) -> (axum::Router, Arc<dyn Store>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("usage.db"));
    store.init().await.expect("init store");
    let store: Arc<dyn Store> = Arc::new(store);

    let gateway = Gateway::new(config, UsageSink::new(Some(store.clone()))).expect("gateway");
    let state = AppState::new(Arc::new(gateway), Some(store.clone()), &config.api_keys);
    (router(state), store, dir)
}

async fn wait_for_usage(store: &Arc<dyn Store>, want: usize) -> Vec<UsageRecord> {
    for _ in 0..100 {
        let rows = store
            .query_usage(UsageQuery::default())
            .await
            .expect("query usage");
        if rows.len() >= want {
            return rows;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {want} usage records");
}

#[tokio::test]
async fn anthropic_messages_use_x_api_key_and_fixed_headers() {
    let upstream = MockServer::start();
    let upstream_mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/messages")
            .header("x-api-key", "sk-ant-upstream")
            .header("anthropic-version", "2023-06-01");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id":"msg-1","content":[{"type":"text","text":"hello there"}]}"#);
    });

    let mut config = base_config();
    config.providers = vec![ProviderConfig {
        id: "claude".to_string(),
        base_url: format!("{}/v1", upstream.base_url()),
        access_token: "sk-ant-upstream".to_string(),
        kind: ProviderKind::Anthropic,
        headers: [("anthropic-version".to_string(), "2023-06-01".to_string())].into(),
        timeout: 0,
    }];
    config.models = vec![ModelConfig {
        name: "claude-3-5-sonnet".to_string(),
        providers: vec![CandidateConfig {
            provider: "claude".to_string(),
            model: String::new(),
        }],
        rules: Vec::new(),
    }];
    let (app, store, _dir) = build_app(&config).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .header("authorization", "Bearer sk-client-key")
        .body(Body::from(
            json!({
                "model": "claude-3-5-sonnet",
                "max_tokens": 64,
                "messages": [{"role": "user", "content": "hi"}]
            })
            .to_string(),
        ))
        .expect("request");

    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    upstream_mock.assert();

    let rows = wait_for_usage(&store, 1).await;
    assert_eq!(rows[0].path, "/v1/messages");
    assert_eq!(rows[0].provider_request_id, "msg-1");
    assert!(rows[0].request_tokens > 0);
    assert!(rows[0].response_tokens > 0);
}

#[tokio::test]
async fn normalizes_legacy_image_parts_before_dispatch() {
    let upstream = MockServer::start();
    let upstream_mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_contains(r#""type":"image_url""#);
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id":"ok"}"#);
    });

    let mut config = base_config();
    config.providers = vec![ProviderConfig {
        id: "p1".to_string(),
        base_url: format!("{}/v1", upstream.base_url()),
        access_token: "sk-p1".to_string(),
        kind: ProviderKind::OpenAi,
        headers: BTreeMap::new(),
        timeout: 0,
    }];
    config.models = vec![ModelConfig {
        name: "gpt-4o".to_string(),
        providers: vec![CandidateConfig {
            provider: "p1".to_string(),
            model: String::new(),
        }],
        rules: Vec::new(),
    }];
    let (app, _store, _dir) = build_app(&config).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "gpt-4o",
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "what is this"},
                        {"type": "image", "image_url": {"url": "https://example.com/cat.png"}}
                    ]
                }]
            })
            .to_string(),
        ))
        .expect("request");

    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    upstream_mock.assert();
}

#[tokio::test]
async fn gzip_responses_pass_through_verbatim_and_still_count() {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(br#"{"id":"gz-9","choices":[{"message":{"content":"compressed answer"}}]}"#)
        .expect("write");
    let compressed = encoder.finish().expect("finish");

    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .header("content-encoding", "gzip")
            .body(compressed.clone());
    });

    let mut config = base_config();
    config.providers = vec![ProviderConfig {
        id: "p1".to_string(),
        base_url: format!("{}/v1", upstream.base_url()),
        access_token: "sk-p1".to_string(),
        kind: ProviderKind::OpenAi,
        headers: BTreeMap::new(),
        timeout: 0,
    }];
    config.models = vec![ModelConfig {
        name: "gpt-4o".to_string(),
        providers: vec![CandidateConfig {
            provider: "p1".to_string(),
            model: String::new(),
        }],
        rules: Vec::new(),
    }];
    let (app, store, _dir) = build_app(&config).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}]
            })
            .to_string(),
        ))
        .expect("request");

    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-encoding")
            .and_then(|v| v.to_str().ok()),
        Some("gzip")
    );
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    assert_eq!(body.as_ref(), compressed.as_slice());

    let rows = wait_for_usage(&store, 1).await;
    assert_eq!(rows[0].provider_request_id, "gz-9");
    assert!(rows[0].response_tokens > 0);
}

#[tokio::test]
async fn generates_a_request_id_when_the_header_is_absent() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id":"ok"}"#);
    });

    let mut config = base_config();
    config.providers = vec![ProviderConfig {
        id: "p1".to_string(),
        base_url: format!("{}/v1", upstream.base_url()),
        access_token: "sk-p1".to_string(),
        kind: ProviderKind::OpenAi,
        headers: BTreeMap::new(),
        timeout: 0,
    }];
    config.models = vec![ModelConfig {
        name: "gpt-4o".to_string(),
        providers: vec![CandidateConfig {
            provider: "p1".to_string(),
            model: String::new(),
        }],
        rules: Vec::new(),
    }];
    let (app, store, _dir) = build_app(&config).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}]
            })
            .to_string(),
        ))
        .expect("request");

    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let rows = wait_for_usage(&store, 1).await;
    assert!(uuid::Uuid::parse_str(&rows[0].request_id).is_ok());
}
