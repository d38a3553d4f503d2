//! Durable usage accounting. The [`Store`] trait is the only surface the
//! gateway sees; backends must be safe for concurrent use.

mod file;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file::FileStore;
pub use sqlite::SqliteStore;

/// One row per provider attempt. Durations are nanoseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(default)]
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub request_id: String,
    pub attempt: u32,
    pub provider: String,
    pub model: String,
    pub original_model: String,
    pub path: String,
    pub provider_request_id: String,
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub status_code: u16,
    pub outcome: String,
    pub error: String,
    pub duration: i64,
    pub first_token_latency: i64,
}

/// Sanitized capture of an incoming request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestLog {
    pub created_at: DateTime<Utc>,
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Clone, Debug, Default)]
pub struct UsageQuery {
    /// Maximum rows to return; non-positive falls back to 100.
    pub limit: i64,
    /// Exact request id match when non-empty.
    pub request_id: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage uri error: {0}")]
    Uri(String),
    #[error("unsupported storage driver {0}")]
    UnsupportedDriver(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn record_usage(&self, record: UsageRecord) -> Result<(), StoreError>;
    async fn record_request_log(&self, log: RequestLog) -> Result<(), StoreError>;
    async fn query_usage(&self, query: UsageQuery) -> Result<Vec<UsageRecord>, StoreError>;
    /// Deletes usage rows older than `cutoff`; returns the number removed.
    async fn delete_usage_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Builds a store from the configured driver and URI. The `mysql` driver is
/// backed by a local append-only JSON-lines file derived from the URI.
pub async fn open(driver: &str, uri: &str) -> Result<Arc<dyn Store>, StoreError> {
    match driver.trim().to_ascii_lowercase().as_str() {
        "sqlite" | "sqlite3" => {
            let store = SqliteStore::from_uri(uri)?;
            store.init().await?;
            Ok(Arc::new(store))
        }
        "mysql" => {
            let store = FileStore::from_mysql_uri(uri)?;
            store.load().await?;
            Ok(Arc::new(store))
        }
        other => Err(StoreError::UnsupportedDriver(other.to_string())),
    }
}
