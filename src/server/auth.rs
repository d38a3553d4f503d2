use std::collections::HashSet;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use super::AppState;

/// Shared-secret allow-list. An empty list disables the check entirely.
pub struct ApiKeyAuth {
    keys: HashSet<String>,
}

impl ApiKeyAuth {
    pub fn new(keys: &[String]) -> Self {
        Self {
            keys: keys
                .iter()
                .filter(|key| !key.is_empty())
                .cloned()
                .collect(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn allows(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.auth.is_open() || skip_auth(request.uri().path()) {
        return next.run(request).await;
    }

    let Some(key) = extract_api_key(request.headers()) else {
        warn!(path = request.uri().path(), "missing api key");
        return auth_error("missing api key");
    };
    if !state.auth.allows(&key) {
        warn!(path = request.uri().path(), "invalid api key");
        return auth_error("invalid api key");
    }

    next.run(request).await
}

fn skip_auth(path: &str) -> bool {
    path == "/healthz"
        || path == "/favicon.ico"
        || path == "/robots.txt"
        || path == "/dashboard"
        || path.starts_with("/dashboard/")
}

/// Bearer token from `Authorization`, or a raw `x-api-key` value.
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let fields: Vec<&str> = auth.split_whitespace().collect();
        if fields.len() == 2 && fields[0].eq_ignore_ascii_case("bearer") {
            return Some(fields[1].to_string());
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

fn auth_error(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}
