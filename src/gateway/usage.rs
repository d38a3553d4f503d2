use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::storage::{RequestLog, Store, UsageRecord};

const PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Fire-and-forget persistence for usage records and request logs. Writes run
/// on detached tasks so a client disconnect never loses a record, and
/// failures are logged and dropped rather than surfaced to the client.
#[derive(Clone)]
pub struct UsageSink {
    store: Option<Arc<dyn Store>>,
}

impl UsageSink {
    pub fn new(store: Option<Arc<dyn Store>>) -> Self {
        Self { store }
    }

    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<Arc<dyn Store>> {
        self.store.clone()
    }

    pub fn record(&self, record: UsageRecord) {
        let Some(store) = self.store.clone() else {
            return;
        };
        spawn_detached(async move {
            match tokio::time::timeout(PERSIST_TIMEOUT, store.record_usage(record)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("save usage record: {err}"),
                Err(_) => warn!("save usage record: timed out"),
            }
        });
    }

    pub fn record_request_log(&self, log: RequestLog) {
        let Some(store) = self.store.clone() else {
            return;
        };
        spawn_detached(async move {
            match tokio::time::timeout(PERSIST_TIMEOUT, store.record_request_log(log)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("save request log: {err}"),
                Err(_) => warn!("save request log: timed out"),
            }
        });
    }
}

/// Persistence can be triggered from a `Drop` impl while a response body is
/// being torn down; outside a runtime the write is dropped with a warning.
fn spawn_detached<F>(future: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => warn!("usage sink called outside a runtime; dropping write"),
    }
}

/// Deletes usage rows older than the retention window, immediately on startup
/// and then at every interval, until the shutdown signal flips.
pub async fn run_retention_cleanup(
    store: Arc<dyn Store>,
    retention_days: u32,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
                match store.delete_usage_before(cutoff).await {
                    Ok(removed) if removed > 0 => {
                        debug!(removed, "usage retention cleanup");
                    }
                    Ok(_) => {}
                    Err(err) => warn!("usage retention cleanup: {err}"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SqliteStore, UsageQuery};

    fn sample(request_id: &str) -> UsageRecord {
        UsageRecord {
            id: 0,
            created_at: Utc::now(),
            request_id: request_id.to_string(),
            attempt: 1,
            provider: "p1".to_string(),
            model: "gpt-4o".to_string(),
            original_model: "gpt-4o".to_string(),
            path: "/v1/chat/completions".to_string(),
            provider_request_id: String::new(),
            request_tokens: 1,
            response_tokens: 2,
            status_code: 200,
            outcome: "success".to_string(),
            error: String::new(),
            duration: 10,
            first_token_latency: 5,
        }
    }

    #[tokio::test]
    async fn record_is_detached_but_durable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("usage.db"));
        store.init().await.expect("init");
        let store: Arc<dyn Store> = Arc::new(store);

        let sink = UsageSink::new(Some(store.clone()));
        sink.record(sample("req-detached"));

        let mut rows = Vec::new();
        for _ in 0..50 {
            rows = store
                .query_usage(UsageQuery::default())
                .await
                .expect("query");
            if !rows.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_id, "req-detached");
    }

    #[tokio::test]
    async fn disabled_sink_is_a_no_op() {
        let sink = UsageSink::disabled();
        assert!(!sink.enabled());
        sink.record(sample("ignored"));
    }

    #[tokio::test]
    async fn cleanup_runs_immediately_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("usage.db"));
        store.init().await.expect("init");
        let store: Arc<dyn Store> = Arc::new(store);

        let mut old = sample("req-old");
        old.created_at = Utc::now() - ChronoDuration::days(10);
        store.record_usage(old).await.expect("insert");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_retention_cleanup(
            store.clone(),
            3,
            Duration::from_secs(3600),
            shutdown_rx,
        ));

        let mut rows = store
            .query_usage(UsageQuery::default())
            .await
            .expect("query");
        for _ in 0..50 {
            if rows.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            rows = store
                .query_usage(UsageQuery::default())
                .await
                .expect("query");
        }
        assert!(rows.is_empty());

        shutdown_tx.send(true).expect("signal");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cleanup task stops")
            .expect("join");
    }
}
