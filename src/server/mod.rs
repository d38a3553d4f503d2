//! HTTP surface: request routing, auth, observability endpoints.

pub mod auth;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::info;

use crate::gateway::{Gateway, RequestKind};
use crate::storage::{Store, UsageQuery, UsageRecord};

use auth::ApiKeyAuth;

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
    store: Option<Arc<dyn Store>>,
    auth: Arc<ApiKeyAuth>,
}

impl AppState {
    pub fn new(
        gateway: Arc<Gateway>,
        store: Option<Arc<dyn Store>>,
        api_keys: &[String],
    ) -> Self {
        Self {
            gateway,
            store,
            auth: Arc::new(ApiKeyAuth::new(api_keys)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/models", get(models))
        .route("/usage", get(usage))
        .route("/favicon.ico", get(favicon))
        .route("/robots.txt", get(robots))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .layer(middleware::from_fn(log_requests))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn chat_completions(State(state): State<AppState>, request: Request) -> Response {
    state
        .gateway
        .proxy(RequestKind::ChatCompletions, request)
        .await
}

async fn responses(State(state): State<AppState>, request: Request) -> Response {
    state.gateway.proxy(RequestKind::Responses, request).await
}

async fn anthropic_messages(State(state): State<AppState>, request: Request) -> Response {
    state
        .gateway
        .proxy(RequestKind::AnthropicMessages, request)
        .await
}

async fn models(State(state): State<AppState>) -> Response {
    Json(state.gateway.model_list().await).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct UsageParams {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Serialize)]
struct UsageResponse {
    data: Vec<UsageRecord>,
    summary: UsageSummary,
}

#[derive(Serialize)]
struct UsageSummary {
    total_requests: usize,
    total_prompt_tokens: i64,
    total_completion_tokens: i64,
}

async fn usage(
    State(state): State<AppState>,
    Query(params): Query<UsageParams>,
) -> Response {
    let Some(store) = state.store.clone() else {
        return Json(UsageResponse {
            data: Vec::new(),
            summary: UsageSummary {
                total_requests: 0,
                total_prompt_tokens: 0,
                total_completion_tokens: 0,
            },
        })
        .into_response();
    };

    let query = UsageQuery {
        limit: params.limit.unwrap_or(100),
        request_id: params.request_id.unwrap_or_default(),
    };
    match store.query_usage(query).await {
        Ok(data) => {
            let summary = summarize(&data);
            Json(UsageResponse { data, summary }).into_response()
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

fn summarize(records: &[UsageRecord]) -> UsageSummary {
    let mut request_ids: std::collections::HashSet<&str> = std::collections::HashSet::new();
    let mut prompt = 0i64;
    let mut completion = 0i64;
    for record in records {
        request_ids.insert(record.request_id.as_str());
        prompt += record.request_tokens;
        completion += record.response_tokens;
    }
    UsageSummary {
        total_requests: request_ids.len(),
        total_prompt_tokens: prompt,
        total_completion_tokens: completion,
    }
}

async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn robots() -> &'static str {
    "User-agent: *\nDisallow: /\n"
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    info!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(request_id: &str, prompt: i64, completion: i64) -> UsageRecord {
        UsageRecord {
            id: 0,
            created_at: chrono::Utc::now(),
            request_id: request_id.to_string(),
            attempt: 1,
            provider: "p1".to_string(),
            model: "gpt-4o".to_string(),
            original_model: "gpt-4o".to_string(),
            path: "/v1/chat/completions".to_string(),
            provider_request_id: String::new(),
            request_tokens: prompt,
            response_tokens: completion,
            status_code: 200,
            outcome: "success".to_string(),
            error: String::new(),
            duration: 0,
            first_token_latency: 0,
        }
    }

    #[test]
    fn summary_counts_distinct_requests_and_sums_tokens() {
        let records = vec![
            record("a", 10, 5),
            record("a", 10, 0),
            record("b", 7, 3),
        ];
        let summary = summarize(&records);
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.total_prompt_tokens, 27);
        assert_eq!(summary.total_completion_tokens, 8);
    }
}
