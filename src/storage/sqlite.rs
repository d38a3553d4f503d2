use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use super::{RequestLog, Store, StoreError, UsageQuery, UsageRecord};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Accepts a plain path or a `file:` URI; query parameters are ignored
    /// because the connection pragmas are fixed (WAL, busy_timeout).
    pub fn from_uri(uri: &str) -> Result<Self, StoreError> {
        let trimmed = uri.trim();
        if trimmed.is_empty() {
            return Err(StoreError::Uri("sqlite uri is empty".to_string()));
        }
        if trimmed == ":memory:" {
            return Err(StoreError::Uri(
                ":memory: sqlite databases are not supported".to_string(),
            ));
        }
        let without_scheme = trimmed.strip_prefix("file:").unwrap_or(trimmed);
        let without_query = without_scheme
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(without_scheme);
        let path = without_query.trim_start_matches("//");
        if path.is_empty() {
            return Err(StoreError::Uri("sqlite uri missing path".to_string()));
        }
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn record_usage(&self, record: UsageRecord) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO usage_records (created_at, path, provider, model, original_model,
                     provider_request_id, request_id, attempt, request_tokens, response_tokens,
                     status, outcome, error, duration, first_token_latency)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                rusqlite::params![
                    format_time(&record.created_at),
                    record.path,
                    record.provider,
                    record.model,
                    record.original_model,
                    record.provider_request_id,
                    record.request_id,
                    record.attempt,
                    record.request_tokens,
                    record.response_tokens,
                    record.status_code,
                    record.outcome,
                    record.error,
                    record.duration,
                    record.first_token_latency,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn record_request_log(&self, log: RequestLog) -> Result<(), StoreError> {
        let path = self.path.clone();
        let headers_json = serde_json::to_string(&log.headers)?;
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO request_logs (created_at, request_id, method, path, headers, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    format_time(&log.created_at),
                    log.request_id,
                    log.method,
                    log.path,
                    headers_json,
                    log.body,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn query_usage(&self, query: UsageQuery) -> Result<Vec<UsageRecord>, StoreError> {
        let path = self.path.clone();
        let limit = if query.limit > 0 { query.limit } else { 100 };
        let request_id = query.request_id;

        tokio::task::spawn_blocking(move || -> Result<Vec<UsageRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let base = "SELECT id, created_at, path, provider, model, original_model,
                            provider_request_id, request_id, attempt, request_tokens,
                            response_tokens, status, outcome, error, duration,
                            first_token_latency
                        FROM usage_records";
            let mut records = Vec::new();
            if request_id.is_empty() {
                let mut stmt = conn.prepare(&format!(
                    "{base} ORDER BY datetime(created_at) DESC, id DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(rusqlite::params![limit], row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            } else {
                let mut stmt = conn.prepare(&format!(
                    "{base} WHERE request_id = ?1
                     ORDER BY datetime(created_at) DESC, id DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(rusqlite::params![request_id, limit], row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            }
            Ok(records)
        })
        .await?
    }

    async fn delete_usage_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let path = self.path.clone();
        let cutoff = format_time(&cutoff);
        tokio::task::spawn_blocking(move || -> Result<u64, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let removed = conn.execute(
                "DELETE FROM usage_records WHERE datetime(created_at) < datetime(?1)",
                rusqlite::params![cutoff],
            )?;
            conn.execute(
                "DELETE FROM request_logs WHERE datetime(created_at) < datetime(?1)",
                rusqlite::params![cutoff],
            )?;
            Ok(removed as u64)
        })
        .await?
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageRecord> {
    Ok(UsageRecord {
        id: row.get(0)?,
        created_at: parse_time(&row.get::<_, String>(1)?),
        path: row.get(2)?,
        provider: row.get(3)?,
        model: row.get(4)?,
        original_model: row.get(5)?,
        provider_request_id: row.get(6)?,
        request_id: row.get(7)?,
        attempt: row.get(8)?,
        request_tokens: row.get(9)?,
        response_tokens: row.get(10)?,
        status_code: row.get(11)?,
        outcome: row.get(12)?,
        error: row.get(13)?,
        duration: row.get(14)?,
        first_token_latency: row.get(15)?,
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS usage_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            path TEXT,
            provider TEXT,
            model TEXT,
            original_model TEXT,
            provider_request_id TEXT,
            request_id TEXT,
            attempt INTEGER NOT NULL DEFAULT 1,
            request_tokens INTEGER NOT NULL DEFAULT 0,
            response_tokens INTEGER NOT NULL DEFAULT 0,
            status INTEGER NOT NULL DEFAULT 0,
            outcome TEXT,
            error TEXT,
            duration INTEGER NOT NULL DEFAULT 0,
            first_token_latency INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_usage_records_created_at
            ON usage_records (created_at DESC);

        CREATE TABLE IF NOT EXISTS request_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            request_id TEXT,
            method TEXT,
            path TEXT,
            headers TEXT,
            body TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_request_logs_created_at
            ON request_logs (created_at DESC);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or_default()
}
