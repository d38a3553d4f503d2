//! A single upstream attempt: request construction, dispatch, first-byte
//! latency tracking, retryable classification, and body passthrough. The
//! client sees bytes only after the attempt is known non-retryable, so the
//! orchestrator can always move to the next candidate safely.

use std::time::Instant;

use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use axum::response::Response;
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::ForwardError;
use crate::storage::UsageRecord;

use super::extract::{
    decode_body_for_analysis, extract_error_message, extract_response_metadata,
    shorten_error_message,
};
use super::urljoin::join_url;
use super::usage::UsageSink;
use super::RequestKind;

/// Streaming responses are teed into memory for post-hoc token extraction.
/// The capture is capped; the forwarded stream itself is never truncated.
const CAPTURE_CAP_BYTES: usize = 4 * 1024 * 1024;

const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

pub(crate) struct AttemptParams<'a> {
    pub provider: &'a ProviderConfig,
    pub model: String,
    pub original_model: String,
    pub body: Bytes,
    pub method: Method,
    pub headers: &'a HeaderMap,
    pub path: String,
    pub raw_query: String,
    pub stream_requested: bool,
    pub kind: RequestKind,
    pub attempt: u32,
    pub request_id: String,
    pub request_tokens: i64,
}

/// Executes one attempt against one provider. Every exit path leaves a usage
/// record in the sink; `Err` carries whether the orchestrator may retry.
pub(crate) async fn forward_attempt(
    client: &reqwest::Client,
    sink: &UsageSink,
    params: AttemptParams<'_>,
) -> Result<Response, ForwardError> {
    let mut record = base_record(&params);
    let started = Instant::now();

    let forward_path = params
        .path
        .strip_prefix("/v1/")
        .unwrap_or(params.path.as_str());
    let url = match join_url(&params.provider.base_url, forward_path, &params.raw_query) {
        Ok(url) => url,
        Err(err) => {
            record.outcome = "failure".to_string();
            record.error = shorten_error_message(&err);
            sink.record(record);
            return Err(ForwardError::BuildUrl(err));
        }
    };

    debug!(
        provider = %params.provider.id,
        model = %params.model,
        url = %url,
        attempt = params.attempt,
        "forward request"
    );

    let mut request = client
        .request(params.method.clone(), url)
        .headers(outgoing_headers(params.headers, params.provider))
        .body(params.body.clone());
    if let Some(timeout) = params.provider.timeout() {
        request = request.timeout(timeout);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            record.outcome = "failure".to_string();
            record.error = shorten_error_message(&err.to_string());
            record.duration = elapsed_nanos(started);
            sink.record(record);
            return Err(ForwardError::Transport {
                provider: params.provider.id.clone(),
                source: err,
            });
        }
    };

    let status = response.status();
    let response_headers = response.headers().clone();
    let content_encoding = header_str(&response_headers, "content-encoding");
    let is_event_stream =
        header_str(&response_headers, "content-type").contains("text/event-stream");
    record.status_code = status.as_u16();

    let mut upstream = response.bytes_stream().boxed();

    // Any status >= 400 is retryable: capture the full response so the last
    // failure can be replayed verbatim once candidates are exhausted.
    if status.as_u16() >= 400 {
        let (body, first_chunk) = drain_stream(&mut upstream).await;
        record.duration = elapsed_nanos(started);
        record.first_token_latency = latency_nanos(started, first_chunk);
        record.outcome = "failure".to_string();
        record.error = shorten_error_message(&extract_error_message(
            &body,
            &content_encoding,
            status,
        ));
        fill_response_metadata(
            &mut record,
            &params,
            &body,
            &content_encoding,
            params.stream_requested || is_event_stream,
        );
        sink.record(record);
        return Err(ForwardError::UpstreamStatus {
            provider: params.provider.id.clone(),
            status,
            headers: response_headers,
            body: Bytes::from(body),
        });
    }

    if params.stream_requested || is_event_stream {
        return Ok(stream_response(
            status,
            response_headers,
            upstream,
            StreamFinalizer {
                sink: sink.clone(),
                record,
                model: params.model.clone(),
                kind: params.kind,
                content_encoding,
                started,
            },
        ));
    }

    // Non-streaming: buffer fully before the client sees anything.
    let mut body = Vec::new();
    let mut first_chunk = None;
    while let Some(next) = upstream.next().await {
        match next {
            Ok(chunk) => {
                if first_chunk.is_none() && !chunk.is_empty() {
                    first_chunk = Some(Instant::now());
                }
                body.extend_from_slice(&chunk);
            }
            Err(err) => {
                record.outcome = "failure".to_string();
                record.error = shorten_error_message(&err.to_string());
                record.duration = elapsed_nanos(started);
                record.first_token_latency = latency_nanos(started, first_chunk);
                sink.record(record);
                return Err(ForwardError::ReadUpstreamBody {
                    provider: params.provider.id.clone(),
                    message: err.to_string(),
                });
            }
        }
    }

    record.duration = elapsed_nanos(started);
    record.first_token_latency = latency_nanos(started, first_chunk);
    record.outcome = "success".to_string();
    fill_response_metadata(&mut record, &params, &body, &content_encoding, false);
    sink.record(record);

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

fn base_record(params: &AttemptParams<'_>) -> UsageRecord {
    UsageRecord {
        id: 0,
        created_at: Utc::now(),
        request_id: params.request_id.clone(),
        attempt: params.attempt,
        provider: params.provider.id.clone(),
        model: params.model.clone(),
        original_model: params.original_model.clone(),
        path: params.path.clone(),
        provider_request_id: String::new(),
        request_tokens: params.request_tokens,
        response_tokens: 0,
        status_code: 0,
        outcome: String::new(),
        error: String::new(),
        duration: 0,
        first_token_latency: 0,
    }
}

/// Copies the incoming headers minus hop-controlled ones, injects the
/// provider credential, then overlays the provider's fixed headers.
fn outgoing_headers(incoming: &HeaderMap, provider: &ProviderConfig) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in incoming {
        match name.as_str() {
            "content-length" | "authorization" | "x-api-key" | "host" => continue,
            _ => out.append(name.clone(), value.clone()),
        };
    }

    match provider.kind {
        ProviderKind::Anthropic => {
            if let Ok(value) = HeaderValue::from_str(&provider.access_token) {
                out.insert(X_API_KEY, value);
            }
            out.remove(AUTHORIZATION);
        }
        ProviderKind::OpenAi => {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", provider.access_token))
            {
                out.insert(AUTHORIZATION, value);
            }
            out.remove(X_API_KEY);
        }
    }

    for (key, value) in &provider.headers {
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            warn!(header = %key, "skipping invalid provider header name");
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            warn!(header = %key, "skipping invalid provider header value");
            continue;
        };
        out.insert(name, value);
    }

    out
}

fn fill_response_metadata(
    record: &mut UsageRecord,
    params: &AttemptParams<'_>,
    body: &[u8],
    content_encoding: &str,
    is_stream: bool,
) {
    let decoded = decode_body_for_analysis(body, content_encoding);
    let (provider_request_id, response_tokens) =
        extract_response_metadata(&params.model, params.kind, &decoded, is_stream);
    if !provider_request_id.is_empty() {
        record.provider_request_id = provider_request_id;
    }
    if response_tokens > 0 {
        record.response_tokens = response_tokens;
    }
}

/// Reads a failed response to completion; read errors end the drain early and
/// the partial body is kept.
async fn drain_stream(
    upstream: &mut BoxStream<'static, reqwest::Result<Bytes>>,
) -> (Vec<u8>, Option<Instant>) {
    let mut body = Vec::new();
    let mut first_chunk = None;
    while let Some(next) = upstream.next().await {
        match next {
            Ok(chunk) => {
                if first_chunk.is_none() && !chunk.is_empty() {
                    first_chunk = Some(Instant::now());
                }
                body.extend_from_slice(&chunk);
            }
            Err(_) => break,
        }
    }
    (body, first_chunk)
}

struct StreamFinalizer {
    sink: UsageSink,
    record: UsageRecord,
    model: String,
    kind: RequestKind,
    content_encoding: String,
    started: Instant,
}

impl StreamFinalizer {
    fn finalize(mut self, captured: &[u8], first_chunk: Option<Instant>, error: Option<String>) {
        self.record.duration = elapsed_nanos(self.started);
        self.record.first_token_latency = latency_nanos(self.started, first_chunk);
        match error {
            Some(message) => {
                self.record.outcome = "failure".to_string();
                self.record.error = shorten_error_message(&message);
            }
            None => self.record.outcome = "success".to_string(),
        }

        let decoded = decode_body_for_analysis(captured, &self.content_encoding);
        let (provider_request_id, response_tokens) =
            extract_response_metadata(&self.model, self.kind, &decoded, true);
        if !provider_request_id.is_empty() {
            self.record.provider_request_id = provider_request_id;
        }
        if response_tokens > 0 {
            self.record.response_tokens = response_tokens;
        }
        self.sink.record(self.record);
    }
}

struct TeeState {
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    captured: Vec<u8>,
    first_chunk: Option<Instant>,
    finalizer: Option<StreamFinalizer>,
}

impl TeeState {
    fn finalize(&mut self, error: Option<String>) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer.finalize(&self.captured, self.first_chunk, error);
        }
    }
}

impl Drop for TeeState {
    fn drop(&mut self) {
        // Reached when the client goes away mid-stream and the body future is
        // dropped; the record still has to land.
        self.finalize(Some("response stream aborted".to_string()));
    }
}

/// Streams the upstream body to the client while teeing a bounded copy for
/// token extraction. The usage record is finalized exactly once, whether the
/// stream completes, errors, or is dropped by the client.
fn stream_response(
    status: reqwest::StatusCode,
    headers: HeaderMap,
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    finalizer: StreamFinalizer,
) -> Response {
    let state = TeeState {
        upstream,
        captured: Vec::new(),
        first_chunk: None,
        finalizer: Some(finalizer),
    };

    let stream = futures_util::stream::try_unfold(state, |mut state| async move {
        match state.upstream.next().await {
            Some(Ok(chunk)) => {
                if state.first_chunk.is_none() && !chunk.is_empty() {
                    state.first_chunk = Some(Instant::now());
                }
                let room = CAPTURE_CAP_BYTES.saturating_sub(state.captured.len());
                if room > 0 {
                    let take = room.min(chunk.len());
                    state.captured.extend_from_slice(&chunk[..take]);
                }
                Ok(Some((chunk, state)))
            }
            Some(Err(err)) => {
                state.finalize(Some(format!("stream response: {err}")));
                Err(std::io::Error::other(err))
            }
            None => {
                state.finalize(None);
                Ok(None)
            }
        }
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn elapsed_nanos(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_nanos()).unwrap_or(i64::MAX)
}

fn latency_nanos(started: Instant, first_chunk: Option<Instant>) -> i64 {
    match first_chunk {
        Some(at) => i64::try_from(at.duration_since(started).as_nanos()).unwrap_or(i64::MAX),
        None => 0,
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}
