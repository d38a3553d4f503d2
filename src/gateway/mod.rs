//! Provider routing and proxy orchestration.

mod extract;
mod forward;
mod request_log;
mod token_count;
mod transform;
mod urljoin;
mod usage;

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{Config, ProviderConfig, ProviderKind};
use crate::error::{ForwardError, GatewayError, Result};
use crate::rule::{EvalEnv, Program};
use crate::storage::UsageRecord;

use forward::{forward_attempt, AttemptParams};
use request_log::build_request_log;

pub use usage::{run_retention_cleanup, UsageSink};

/// Incoming bodies are buffered before dispatch; anything larger is a client
/// error.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const UPSTREAM_EXCHANGE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    ChatCompletions,
    Responses,
    AnthropicMessages,
}

#[derive(Clone, Debug)]
struct Candidate {
    provider: String,
    model: String,
}

struct CompiledRule {
    program: Program,
    candidates: Vec<Candidate>,
}

struct ModelRoute {
    candidates: Vec<Candidate>,
    rules: Vec<CompiledRule>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelListResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

pub struct Gateway {
    providers: HashMap<String, ProviderConfig>,
    models: HashMap<String, ModelRoute>,
    default_provider: Option<ProviderConfig>,
    model_list: Vec<ModelInfo>,
    client: reqwest::Client,
    sink: UsageSink,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Gateway {
    /// Builds the immutable routing tables. Rule expressions compile here;
    /// a bad expression aborts startup.
    pub fn new(config: &Config, sink: UsageSink) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_EXCHANGE_TIMEOUT)
            .build()
            .map_err(|err| GatewayError::Config(format!("build http client: {err}")))?;

        let mut providers = HashMap::new();
        for provider in &config.providers {
            providers.insert(provider.id.clone(), provider.clone());
        }

        let default_provider = (!config.default_provider.is_empty())
            .then(|| providers.get(&config.default_provider).cloned())
            .flatten();

        let created = Utc::now().timestamp();
        let mut models = HashMap::new();
        let mut model_list = Vec::new();
        for model in &config.models {
            let mut rules = Vec::new();
            for rule in &model.rules {
                let program = Program::compile(&rule.expression).map_err(|err| {
                    GatewayError::Config(format!(
                        "compile rule {} for model {}: {err}",
                        rule.expression, model.name
                    ))
                })?;
                rules.push(CompiledRule {
                    program,
                    candidates: rule.providers.iter().map(candidate_from_config).collect(),
                });
            }
            models.insert(
                model.name.clone(),
                ModelRoute {
                    candidates: model.providers.iter().map(candidate_from_config).collect(),
                    rules,
                },
            );
            model_list.push(ModelInfo {
                id: model.name.clone(),
                object: "model".to_string(),
                created,
                owned_by: "costgate".to_string(),
            });
        }

        Ok(Self {
            providers,
            models,
            default_provider,
            model_list,
            client,
            sink,
        })
    }

    /// Serves one incoming proxy request end to end, iterating candidates
    /// until one succeeds or the list is exhausted.
    pub async fn proxy(&self, kind: RequestKind, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("read request body: {err}"),
                );
            }
        };

        let body = match transform::normalize_request_body(&body, kind) {
            Ok(Some(normalized)) => Bytes::from(normalized),
            Ok(None) => body,
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("normalize request body: {err}"),
                );
            }
        };

        let payload: Option<Value> = serde_json::from_slice(&body).ok();
        let model_name = payload
            .as_ref()
            .and_then(|value| value.get("model"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if model_name.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "model is required");
        }
        let stream_requested = payload
            .as_ref()
            .and_then(|value| value.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let token_count = token_count::count_request_tokens(&model_name, kind, &body);
        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let path = parts.uri.path().to_string();
        let raw_query = parts.uri.query().unwrap_or_default().to_string();

        if self.sink.enabled() {
            let path_and_query = if raw_query.is_empty() {
                path.clone()
            } else {
                format!("{path}?{raw_query}")
            };
            self.sink.record_request_log(build_request_log(
                &request_id,
                parts.method.as_str(),
                &path_and_query,
                &parts.headers,
                &body,
            ));
        }

        let Some(route) = self.models.get(&model_name) else {
            return self
                .proxy_to_default(
                    kind,
                    &parts,
                    body,
                    model_name,
                    stream_requested,
                    token_count,
                    request_id,
                    path,
                    raw_query,
                )
                .await;
        };

        let env = EvalEnv {
            token_count,
            model: model_name.clone(),
            path: path.clone(),
        };
        let candidates = self.select_candidates(route, &env);
        if candidates.is_empty() {
            return error_response(StatusCode::BAD_GATEWAY, "no provider available");
        }

        debug!(model = %model_name, candidates = ?candidates, "selected providers");

        let mut last_err: Option<ForwardError> = None;
        for (idx, candidate) in candidates.iter().enumerate() {
            let attempt = (idx + 1) as u32;

            let Some(provider) = self.providers.get(&candidate.provider) else {
                let err = ForwardError::ProviderNotFound(candidate.provider.clone());
                self.sink.record(failure_record(
                    &candidate.provider,
                    &candidate.model,
                    &model_name,
                    &path,
                    &request_id,
                    token_count,
                    attempt,
                    &err.to_string(),
                ));
                last_err = Some(err);
                continue;
            };

            let target_model = if candidate.model.is_empty() {
                model_name.clone()
            } else {
                candidate.model.clone()
            };

            let outbound_body = if target_model == model_name {
                body.clone()
            } else {
                match rewrite_model(&body, &target_model) {
                    Ok(rewritten) => rewritten,
                    Err(err) => {
                        self.sink.record(failure_record(
                            &provider.id,
                            &target_model,
                            &model_name,
                            &path,
                            &request_id,
                            token_count,
                            attempt,
                            &err.to_string(),
                        ));
                        last_err = Some(ForwardError::RewriteBody(err));
                        continue;
                    }
                }
            };

            let params = AttemptParams {
                provider,
                model: target_model,
                original_model: model_name.clone(),
                body: outbound_body,
                method: parts.method.clone(),
                headers: &parts.headers,
                path: path.clone(),
                raw_query: raw_query.clone(),
                stream_requested,
                kind,
                attempt,
                request_id: request_id.clone(),
                request_tokens: token_count,
            };

            match forward_attempt(&self.client, &self.sink, params).await {
                Ok(response) => return response,
                Err(err) if err.is_retryable() => {
                    warn!(
                        model = %model_name,
                        provider = %candidate.provider,
                        "provider failed, trying next candidate: {err}"
                    );
                    last_err = Some(err);
                }
                Err(err) => {
                    warn!(model = %model_name, provider = %candidate.provider, "forward: {err}");
                    return error_response(StatusCode::BAD_GATEWAY, err.to_string());
                }
            }
        }

        match last_err {
            Some(ForwardError::UpstreamStatus {
                status,
                headers,
                body,
                ..
            }) => {
                // Candidates exhausted: the client sees the most recent
                // upstream response verbatim.
                let mut response = Response::new(Body::from(body));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Some(err) => error_response(StatusCode::BAD_GATEWAY, err.to_string()),
            None => error_response(StatusCode::BAD_GATEWAY, "no available provider"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn proxy_to_default(
        &self,
        kind: RequestKind,
        parts: &axum::http::request::Parts,
        body: Bytes,
        model_name: String,
        stream_requested: bool,
        token_count: i64,
        request_id: String,
        path: String,
        raw_query: String,
    ) -> Response {
        let Some(provider) = &self.default_provider else {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("model {model_name} not configured"),
            );
        };

        let params = AttemptParams {
            provider,
            model: model_name.clone(),
            original_model: model_name.clone(),
            body,
            method: parts.method.clone(),
            headers: &parts.headers,
            path,
            raw_query,
            stream_requested,
            kind,
            attempt: 1,
            request_id,
            request_tokens: token_count,
        };

        match forward_attempt(&self.client, &self.sink, params).await {
            Ok(response) => response,
            Err(err) if err.is_retryable() => {
                warn!(model = %model_name, "forward to default provider: {err}");
                error_response(StatusCode::BAD_GATEWAY, err.to_string())
            }
            Err(err) => {
                warn!(model = %model_name, "forward to default provider: {err}");
                error_response(
                    StatusCode::BAD_GATEWAY,
                    format!("forward to default provider: {err}"),
                )
            }
        }
    }

    /// First rule that evaluates to `true` wins; rule errors are logged and
    /// skipped. No match falls back to the model's default candidates.
    fn select_candidates(&self, route: &ModelRoute, env: &EvalEnv) -> Vec<Candidate> {
        for rule in &route.rules {
            match rule.program.eval(env) {
                Ok(true) => return rule.candidates.clone(),
                Ok(false) => {}
                Err(err) => {
                    warn!(rule = rule.program.source(), "eval rule: {err}");
                }
            }
        }
        route.candidates.clone()
    }

    /// Configured logical models merged with the default provider's own
    /// model list; configured entries win on id collisions.
    pub async fn model_list(&self) -> ModelListResponse {
        let mut data = self.model_list.clone();
        let mut seen: std::collections::HashSet<String> =
            data.iter().map(|model| model.id.clone()).collect();

        if let Some(provider) = &self.default_provider {
            match self.fetch_provider_models(provider).await {
                Ok(models) => {
                    for model in models {
                        if seen.insert(model.id.clone()) {
                            data.push(model);
                        }
                    }
                }
                Err(err) => warn!("fetch default provider models: {err}"),
            }
        }

        ModelListResponse {
            object: "list".to_string(),
            data,
        }
    }

    async fn fetch_provider_models(
        &self,
        provider: &ProviderConfig,
    ) -> std::result::Result<Vec<ModelInfo>, String> {
        let url = urljoin::join_url(&provider.base_url, "/models", "")
            .map_err(|err| format!("build provider url: {err}"))?;

        let mut request = self.client.get(url);
        request = match provider.kind {
            ProviderKind::Anthropic => request.header("x-api-key", &provider.access_token),
            ProviderKind::OpenAi => request.header(
                "Authorization",
                format!("Bearer {}", provider.access_token),
            ),
        };
        for (key, value) in &provider.headers {
            request = request.header(key, value);
        }
        if let Some(timeout) = provider.timeout() {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|err| format!("fetch models from {}: {err}", provider.id))?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(format!(
                "provider {} returned status {}: {}",
                provider.id,
                status.as_u16(),
                body.trim()
            ));
        }

        let list: ModelListResponse = response
            .json()
            .await
            .map_err(|err| format!("decode provider response: {err}"))?;
        Ok(list.data)
    }
}

fn candidate_from_config(config: &crate::config::CandidateConfig) -> Candidate {
    Candidate {
        provider: config.provider.clone(),
        model: config.model.clone(),
    }
}

fn rewrite_model(body: &Bytes, model: &str) -> std::result::Result<Bytes, serde_json::Error> {
    let mut payload: Value = serde_json::from_slice(body)?;
    if let Some(object) = payload.as_object_mut() {
        object.insert("model".to_string(), Value::String(model.to_string()));
    }
    serde_json::to_vec(&payload).map(Bytes::from)
}

#[allow(clippy::too_many_arguments)]
fn failure_record(
    provider: &str,
    model: &str,
    original_model: &str,
    path: &str,
    request_id: &str,
    request_tokens: i64,
    attempt: u32,
    error: &str,
) -> UsageRecord {
    UsageRecord {
        id: 0,
        created_at: Utc::now(),
        request_id: request_id.to_string(),
        attempt,
        provider: provider.to_string(),
        model: if model.is_empty() {
            original_model.to_string()
        } else {
            model.to_string()
        },
        original_model: original_model.to_string(),
        path: path.to_string(),
        provider_request_id: String::new(),
        request_tokens,
        response_tokens: 0,
        status_code: 0,
        outcome: "failure".to_string(),
        error: extract::shorten_error_message(error),
        duration: 0,
        first_token_latency: 0,
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}
