//! Persistence operations for the audit log.
//!
//! All writes go through [`emit_event`], which serialises the payload and
//! assigns the next sequence number inside the same `INSERT`. Reads go
//! through [`query_events`].

use rusqlite::{params, Connection};

use crate::error::ObserveError;
use crate::event::{AuditEvent, EventDomain, EventPayload, Severity};

/// Appends one event to the audit log.
///
/// # Errors
///
/// Returns `ObserveError::Database` on SQL failure or
/// `ObserveError::Serialization` if the payload cannot be serialised.
pub fn emit_event(
    conn: &Connection,
    entity_id: &str,
    payload: &EventPayload,
) -> Result<AuditEvent, ObserveError> {
    let payload_json = serde_json::to_string(payload)?;
    let domain = payload.domain();
    let severity = payload.severity();
    let occurred_at = beacon_types::now_timestamp();

    // seq is computed inside the INSERT so concurrent writers cannot
    // observe the same MAX(seq).
    let (id, seq): (i64, i64) = conn.query_row(
        "INSERT INTO audit_log
            (seq, domain, event_type, severity, entity_id, payload_json, occurred_at)
         VALUES (
            (SELECT COALESCE(MAX(seq), 0) + 1 FROM audit_log),
            ?1, ?2, ?3, ?4, ?5, ?6
         )
         RETURNING id, seq",
        params![
            domain.as_str(),
            payload.event_type(),
            severity.as_str(),
            entity_id,
            payload_json,
            occurred_at,
        ],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(AuditEvent {
        id,
        seq,
        domain: domain.as_str().to_string(),
        event_type: payload.event_type().to_string(),
        severity: severity.as_str().to_string(),
        entity_id: entity_id.to_string(),
        payload_json,
        occurred_at,
    })
}

/// Filter criteria for [`query_events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub domain: Option<EventDomain>,
    pub event_type: Option<String>,
    pub entity_id: Option<String>,
    /// Only events at or above this severity.
    pub min_severity: Option<Severity>,
    /// Only events with `seq` strictly greater than this (cursor).
    pub after_seq: Option<i64>,
    /// Maximum number of events to return (default: 100).
    pub limit: Option<i64>,
}

/// Reads events in log order (oldest first).
///
/// # Errors
///
/// Returns `ObserveError::Database` on SQL failure.
pub fn query_events(conn: &Connection, filter: &EventFilter) -> Result<Vec<AuditEvent>, ObserveError> {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(domain) = filter.domain {
        values.push(Box::new(domain.as_str()));
        clauses.push(format!("domain = ?{}", values.len()));
    }
    if let Some(ref event_type) = filter.event_type {
        values.push(Box::new(event_type.clone()));
        clauses.push(format!("event_type = ?{}", values.len()));
    }
    if let Some(ref entity_id) = filter.entity_id {
        values.push(Box::new(entity_id.clone()));
        clauses.push(format!("entity_id = ?{}", values.len()));
    }
    if let Some(min) = filter.min_severity {
        let allowed: Vec<&str> = [Severity::Info, Severity::Warning, Severity::Critical]
            .into_iter()
            .filter(|s| *s >= min)
            .map(Severity::as_str)
            .collect();
        let mut placeholders = Vec::with_capacity(allowed.len());
        for label in allowed {
            values.push(Box::new(label));
            placeholders.push(format!("?{}", values.len()));
        }
        clauses.push(format!("severity IN ({})", placeholders.join(", ")));
    }
    if let Some(after) = filter.after_seq {
        values.push(Box::new(after));
        clauses.push(format!("seq > ?{}", values.len()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    values.push(Box::new(filter.limit.unwrap_or(100)));
    let sql = format!(
        "SELECT id, seq, domain, event_type, severity, entity_id, payload_json, occurred_at
         FROM audit_log
         {where_clause}
         ORDER BY seq ASC
         LIMIT ?{}",
        values.len()
    );

    let refs: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| &**v).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(refs.as_slice(), |row| {
        Ok(AuditEvent {
            id: row.get(0)?,
            seq: row.get(1)?,
            domain: row.get(2)?,
            event_type: row.get(3)?,
            severity: row.get(4)?,
            entity_id: row.get(5)?,
            payload_json: row.get(6)?,
            occurred_at: row.get(7)?,
        })
    })?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}
