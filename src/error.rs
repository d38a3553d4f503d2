use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("config error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a single upstream attempt. Retryable variants drive candidate
/// iteration; everything else ends the request.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("build provider url: {0}")]
    BuildUrl(String),
    #[error("provider {provider} returned status {status}")]
    UpstreamStatus {
        provider: String,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    #[error("forward request to {provider}: {source}")]
    Transport {
        provider: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("read response from {provider}: {message}")]
    ReadUpstreamBody { provider: String, message: String },
    #[error("provider {0} not found")]
    ProviderNotFound(String),
    #[error("modify request body: {0}")]
    RewriteBody(serde_json::Error),
}

impl ForwardError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ForwardError::UpstreamStatus { .. } | ForwardError::Transport { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
