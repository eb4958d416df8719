//! The audit sink capability handed to mesh services.

use std::sync::{Arc, Mutex};

use beacon_db::DbPool;

use crate::error::ObserveError;
use crate::event::{AuditEvent, EventPayload};
use crate::store::emit_event;

/// Append-only destination for security-relevant events.
pub trait AuditSink: Send + Sync {
    /// Appends one event about `entity_id`.
    fn record(&self, entity_id: &str, payload: &EventPayload) -> Result<AuditEvent, ObserveError>;
}

/// Records an event, logging instead of failing when the sink errors.
///
/// Audit failures must never abort the operation being audited.
pub fn record_or_warn(sink: &dyn AuditSink, entity_id: &str, payload: &EventPayload) {
    if let Err(e) = sink.record(entity_id, payload) {
        tracing::warn!(
            domain = payload.domain().as_str(),
            event_type = payload.event_type(),
            entity_id,
            "failed to record audit event: {}",
            e
        );
    }
}

/// [`record_or_warn`] for async callers.
///
/// The sink may block on a pool checkout, so the write runs on the
/// blocking thread pool.
pub async fn record_or_warn_async(
    sink: Arc<dyn AuditSink>,
    entity_id: &str,
    payload: EventPayload,
) {
    let entity = entity_id.to_string();
    let event_type = payload.event_type();
    let task =
        tokio::task::spawn_blocking(move || record_or_warn(sink.as_ref(), &entity, &payload));
    if let Err(e) = task.await {
        tracing::warn!(event_type, entity_id, "audit task failed: {}", e);
    }
}

/// [`AuditSink`] writing to the `audit_log` table.
#[derive(Clone)]
pub struct SqliteAuditSink {
    pool: DbPool,
}

impl SqliteAuditSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl AuditSink for SqliteAuditSink {
    fn record(&self, entity_id: &str, payload: &EventPayload) -> Result<AuditEvent, ObserveError> {
        let conn = self.pool.get()?;
        emit_event(&conn, entity_id, payload)
    }
}

/// [`AuditSink`] that keeps events in memory, for tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<(String, EventPayload)>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every recorded `(entity_id, payload)` pair.
    pub fn events(&self) -> Vec<(String, EventPayload)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Returns the event types recorded so far, in order.
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events()
            .iter()
            .map(|(_, payload)| payload.event_type())
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entity_id: &str, payload: &EventPayload) -> Result<AuditEvent, ObserveError> {
        let mut events = self.events.lock().map_err(|_| ObserveError::LockPoisoned)?;
        events.push((entity_id.to_string(), payload.clone()));
        let seq = events.len() as i64;
        Ok(AuditEvent {
            id: seq,
            seq,
            domain: payload.domain().as_str().to_string(),
            event_type: payload.event_type().to_string(),
            severity: payload.severity().as_str().to_string(),
            entity_id: entity_id.to_string(),
            payload_json: serde_json::to_string(payload)?,
            occurred_at: beacon_types::now_timestamp(),
        })
    }
}
