//! Audit record lifecycle for a single proxied call.
//!
//! A record is inserted before dispatch and updated exactly once when the
//! call ends. The update runs on its own task, so the response never waits
//! on storage. Both steps are announced on the event hub. Storage failures
//! are logged and never reach the caller.

use crate::api::streaming::reconstruct_stream_body;
use crate::core::database::{AuditLog, LogRecord};
use crate::services::event_hub::{BroadcastEvent, EventHub};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

/// Status recorded when the client goes away before the call completes.
pub const CLIENT_CLOSED_REQUEST: i64 = 499;

/// Response body as it will be stored.
#[derive(Debug)]
pub enum AuditBody {
    Text(String),
    /// Raw event-stream chunks, reconstructed when the record is written.
    Stream { chunks: Vec<Bytes>, encoding: String },
}

impl AuditBody {
    fn render(self) -> String {
        match self {
            AuditBody::Text(text) => text,
            AuditBody::Stream { chunks, encoding } => reconstruct_stream_body(&chunks, &encoding),
        }
    }
}

/// Audit store plus the hub its changes are announced on.
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn AuditLog>,
    hub: Arc<EventHub>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn AuditLog>, hub: Arc<EventHub>) -> Self {
        Self { store, hub }
    }

    /// Insert a pending record and announce it.
    ///
    /// Returns `None` if the insert failed; the call then proceeds
    /// unaudited and no events are published for it.
    pub async fn begin(&self, mut record: LogRecord) -> Option<PendingAudit> {
        match self.store.insert(&record).await {
            Ok(id) => {
                record.id = id;
                tracing::info!(
                    "[ID:{}] {} {} {} {} bytes sent",
                    id,
                    record.backend,
                    record.method,
                    record.target_url,
                    record.request_body_size
                );
                self.hub.publish(BroadcastEvent::insert(record.clone()));
                Some(PendingAudit {
                    trail: self.clone(),
                    record: Some(record),
                    started: Instant::now(),
                })
            }
            Err(e) => {
                tracing::error!(backend = %record.backend, "Error logging initial request: {}", e);
                None
            }
        }
    }

    async fn finish(&self, record: LogRecord) {
        match self.store.update(&record).await {
            Ok(()) => {
                tracing::info!(
                    "[ID:{}] {} ({}) {} bytes received in {}ms",
                    record.id,
                    record.backend,
                    record.response_status,
                    record.response_body_size,
                    record.duration_ms
                );
                self.hub.publish(BroadcastEvent::update(record));
            }
            Err(e) => {
                tracing::error!(id = record.id, "Error updating request log: {}", e);
            }
        }
    }
}

/// A record awaiting its terminal update.
///
/// Dropping it without completing records the call as abandoned by the
/// client.
pub struct PendingAudit {
    trail: AuditTrail,
    record: Option<LogRecord>,
    started: Instant,
}

impl PendingAudit {
    pub fn id(&self) -> i64 {
        self.record.as_ref().map_or(0, |r| r.id)
    }

    /// Write the terminal state in the background.
    ///
    /// Never waits on storage. The returned handle resolves once the update
    /// has been attempted; dropping it leaves the write running.
    pub fn detach(mut self, status: i64, headers: String, body: AuditBody) -> Option<JoinHandle<()>> {
        self.spawn_finish(status, headers, body)
    }

    fn spawn_finish(
        &mut self,
        status: i64,
        headers: String,
        body: AuditBody,
    ) -> Option<JoinHandle<()>> {
        let mut record = self.record.take()?;
        let duration_ms = self.started.elapsed().as_millis() as i64;
        let trail = self.trail.clone();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(id = record.id, "No runtime available, audit update lost");
            return None;
        };

        Some(runtime.spawn(async move {
            record.response_status = status;
            record.response_headers = headers;
            record.response_body = body.render();
            record.response_body_size = record.response_body.len() as i64;
            record.duration_ms = duration_ms;
            trail.finish(record).await;
        }))
    }
}

impl Drop for PendingAudit {
    fn drop(&mut self) {
        if self.record.is_some() {
            tracing::debug!(id = self.id(), "Client disconnected before completion");
            self.spawn_finish(
                CLIENT_CLOSED_REQUEST,
                String::new(),
                AuditBody::Text(String::new()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::database::SqliteAuditLog;
    use crate::services::event_hub::EventType;
    use async_trait::async_trait;
    use std::time::Duration;

    async fn trail() -> (AuditTrail, Arc<SqliteAuditLog>, Arc<EventHub>) {
        let store = Arc::new(SqliteAuditLog::connect_in_memory().await.unwrap());
        let hub = Arc::new(EventHub::new(16));
        (AuditTrail::new(store.clone(), hub.clone()), store, hub)
    }

    fn record() -> LogRecord {
        LogRecord {
            timestamp: "2024-05-01T00:00:00Z".to_string(),
            backend: "ollama".to_string(),
            method: "POST".to_string(),
            target_url: "http://localhost:11434/v1/chat/completions".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_then_update_events() {
        let (trail, store, hub) = trail().await;
        let mut sub = hub.subscribe();

        let pending = trail.begin(record()).await.unwrap();
        let id = pending.id();
        pending
            .detach(200, "{}".to_string(), AuditBody::Text("done".to_string()))
            .unwrap()
            .await
            .unwrap();

        let insert = sub.recv().await.unwrap();
        let update = sub.recv().await.unwrap();
        assert_eq!(insert.event_type, EventType::Insert);
        assert_eq!(insert.entry.id, id);
        assert!(insert.entry.is_pending());
        assert_eq!(update.event_type, EventType::Update);
        assert_eq!(update.entry.response_status, 200);
        assert_eq!(update.entry.response_body_size, 4);

        let stored = store.detail(id).await.unwrap().unwrap();
        assert_eq!(stored.response_body, "done");
        assert!(stored.duration_ms >= 0);
    }

    #[tokio::test]
    async fn test_drop_records_client_disconnect() {
        let (trail, store, hub) = trail().await;
        let mut sub = hub.subscribe();

        let pending = trail.begin(record()).await.unwrap();
        let id = pending.id();
        drop(pending);

        sub.recv().await.unwrap();
        let update = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.entry.response_status, CLIENT_CLOSED_REQUEST);
        assert_eq!(store.detail(id).await.unwrap().unwrap().response_status, 499);
    }

    #[tokio::test]
    async fn test_stream_body_is_reconstructed() {
        let (trail, store, _hub) = trail().await;
        let pending = trail.begin(record()).await.unwrap();
        let id = pending.id();

        let chunk = "data: {\"id\":\"a\",\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n";
        pending
            .detach(
                200,
                String::new(),
                AuditBody::Stream {
                    chunks: vec![Bytes::from(chunk)],
                    encoding: String::new(),
                },
            )
            .unwrap()
            .await
            .unwrap();

        let stored = store.detail(id).await.unwrap().unwrap();
        let body: serde_json::Value = serde_json::from_str(&stored.response_body).unwrap();
        assert_eq!(body["content"], "hi");
    }

    struct FailingStore;

    #[async_trait]
    impl AuditLog for FailingStore {
        async fn insert(&self, _: &LogRecord) -> Result<i64, sqlx::Error> {
            Err(sqlx::Error::PoolClosed)
        }
        async fn update(&self, _: &LogRecord) -> Result<(), sqlx::Error> {
            Err(sqlx::Error::PoolClosed)
        }
        async fn list(&self, _: i64, _: u32) -> Result<crate::core::database::LogPage, sqlx::Error> {
            Err(sqlx::Error::PoolClosed)
        }
        async fn detail(&self, _: i64) -> Result<Option<LogRecord>, sqlx::Error> {
            Err(sqlx::Error::PoolClosed)
        }
    }

    #[tokio::test]
    async fn test_failed_insert_publishes_nothing() {
        let hub = Arc::new(EventHub::new(4));
        let trail = AuditTrail::new(Arc::new(FailingStore), hub.clone());
        let mut sub = hub.subscribe();

        assert!(trail.begin(record()).await.is_none());

        hub.publish(BroadcastEvent::update(LogRecord::default()));
        let next = sub.recv().await.unwrap();
        assert_eq!(next.event_type, EventType::Update);
        assert_eq!(next.entry.id, 0);
    }
}
