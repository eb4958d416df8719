//! Durable store of trusted peers, keyed by fingerprint.

use std::sync::Arc;

use beacon_db::DbPool;
use beacon_observe::{record_or_warn, AuditSink, EventPayload};
use beacon_types::{
    now_timestamp, short_fingerprint, BeaconIdentity, FederationState, PeerRecord, PeerStatus,
    SanitizedPeer,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::locks::KeyedLocks;

/// Errors produced by peer store operations.
#[derive(Debug, Error)]
pub enum PeerStoreError {
    #[error("peer not found: {0}")]
    NotFound(String),

    #[error("peer database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("peer pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("peer federation record is unreadable: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("peer lock poisoned")]
    LockPoisoned,
}

/// What [`PeerStore::add_peer`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddPeerOutcome {
    /// A new record was created.
    Inserted,
    /// A record with this fingerprint already existed; nothing changed.
    AlreadyPresent,
    /// The identity was this beacon's own.
    SelfRejected,
}

const PEER_COLUMNS: &str = "beacon_id, domain, fingerprint, public_key, mesh_url, peered_at,
     status, last_check, last_check_status, federation_json";

fn peer_from_row(row: &Row<'_>) -> rusqlite::Result<PeerRecord> {
    let status: String = row.get(6)?;
    let status = status.parse::<PeerStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let federation_json: Option<String> = row.get(9)?;
    let federation = match federation_json {
        Some(json) => Some(serde_json::from_str::<FederationState>(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(PeerRecord {
        beacon_id: row.get(0)?,
        domain: row.get(1)?,
        fingerprint: row.get(2)?,
        public_key: row.get(3)?,
        mesh_url: row.get(4)?,
        peered_at: row.get(5)?,
        status,
        last_check: row.get(7)?,
        last_check_status: row.get(8)?,
        federation,
    })
}

fn load_peer(conn: &Connection, fingerprint: &str) -> Result<Option<PeerRecord>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {PEER_COLUMNS} FROM peers WHERE fingerprint = ?1"),
        params![fingerprint],
        peer_from_row,
    )
    .optional()
}

/// Fingerprint-keyed peer records.
///
/// Writes to one fingerprint are serialized; different fingerprints proceed
/// independently.
#[derive(Clone)]
pub struct PeerStore {
    pool: DbPool,
    locks: Arc<KeyedLocks>,
    own_beacon_id: String,
    audit: Arc<dyn AuditSink>,
}

impl PeerStore {
    /// `own_beacon_id` is this beacon's id, used by the self-peering guard.
    pub fn new(pool: DbPool, own_beacon_id: impl Into<String>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            pool,
            locks: Arc::new(KeyedLocks::new()),
            own_beacon_id: own_beacon_id.into(),
            audit,
        }
    }

    /// Records a verified identity as a trusted peer.
    ///
    /// Never stores this beacon itself. Adding a fingerprint that is already
    /// present changes nothing.
    pub fn add_peer(&self, identity: &BeaconIdentity) -> Result<AddPeerOutcome, PeerStoreError> {
        if identity.beacon_id == self.own_beacon_id {
            tracing::warn!(beacon_id = %identity.beacon_id, "refusing to peer with self");
            record_or_warn(
                self.audit.as_ref(),
                &identity.beacon_id,
                &EventPayload::SelfPeeringRejected {
                    beacon_id: identity.beacon_id.clone(),
                },
            );
            return Ok(AddPeerOutcome::SelfRejected);
        }

        let lock = self.locks.lock_for(&identity.fingerprint);
        let _guard = lock.lock().map_err(|_| PeerStoreError::LockPoisoned)?;

        let conn = self.pool.get()?;
        let inserted = conn.execute(
            "INSERT INTO peers
                (beacon_id, domain, fingerprint, public_key, mesh_url, peered_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active')
             ON CONFLICT(fingerprint) DO NOTHING",
            params![
                identity.beacon_id,
                identity.domain,
                identity.fingerprint,
                identity.public_key,
                identity.mesh_endpoint(),
                now_timestamp(),
            ],
        )?;

        if inserted == 0 {
            tracing::debug!(fingerprint = %identity.short_fingerprint(), "peer already present");
            return Ok(AddPeerOutcome::AlreadyPresent);
        }

        tracing::info!(
            fingerprint = %identity.short_fingerprint(),
            domain = %identity.domain,
            "peer added"
        );
        record_or_warn(
            self.audit.as_ref(),
            &identity.fingerprint,
            &EventPayload::PeerAdded {
                fingerprint: identity.fingerprint.clone(),
                beacon_id: identity.beacon_id.clone(),
                domain: identity.domain.clone(),
            },
        );
        Ok(AddPeerOutcome::Inserted)
    }

    pub fn get_peer(&self, fingerprint: &str) -> Result<Option<PeerRecord>, PeerStoreError> {
        let conn = self.pool.get()?;
        Ok(load_peer(&conn, fingerprint)?)
    }

    /// Full records including federation credentials. Internal use only.
    pub fn list_peers(&self) -> Result<Vec<PeerRecord>, PeerStoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PEER_COLUMNS} FROM peers ORDER BY peered_at, fingerprint"
        ))?;
        let rows = stmt.query_map([], peer_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The projection safe to expose through the mesh API.
    pub fn list_peers_sanitized(&self) -> Result<Vec<SanitizedPeer>, PeerStoreError> {
        Ok(self.list_peers()?.iter().map(PeerRecord::sanitized).collect())
    }

    pub fn count(&self) -> Result<usize, PeerStoreError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM peers", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Stores the outcome of a reachability probe.
    ///
    /// Returns the status held before this check, or `None` if the peer was
    /// removed in the meantime.
    pub fn record_check(
        &self,
        fingerprint: &str,
        reachable: bool,
        detail: &str,
    ) -> Result<Option<PeerStatus>, PeerStoreError> {
        let lock = self.locks.lock_for(fingerprint);
        let _guard = lock.lock().map_err(|_| PeerStoreError::LockPoisoned)?;

        let conn = self.pool.get()?;
        let Some(current) = load_peer(&conn, fingerprint)? else {
            return Ok(None);
        };
        let status = if reachable {
            PeerStatus::Active
        } else {
            PeerStatus::Unreachable
        };
        conn.execute(
            "UPDATE peers SET status = ?2, last_check = ?3, last_check_status = ?4
             WHERE fingerprint = ?1",
            params![fingerprint, status.as_str(), now_timestamp(), detail],
        )?;
        Ok(Some(current.status))
    }

    /// Replaces the federation sub-record. Returns `false` if the peer is gone.
    pub fn set_federation(
        &self,
        fingerprint: &str,
        state: &FederationState,
    ) -> Result<bool, PeerStoreError> {
        let lock = self.locks.lock_for(fingerprint);
        let _guard = lock.lock().map_err(|_| PeerStoreError::LockPoisoned)?;
        let conn = self.pool.get()?;
        write_federation(&conn, fingerprint, state)
    }

    /// Read-modify-write of the federation sub-record under the peer's lock.
    ///
    /// A missing sub-record starts out `PENDING`. Returns the stored state,
    /// or `None` if the peer is gone.
    pub fn update_federation<F>(
        &self,
        fingerprint: &str,
        update: F,
    ) -> Result<Option<FederationState>, PeerStoreError>
    where
        F: FnOnce(&mut FederationState),
    {
        let lock = self.locks.lock_for(fingerprint);
        let _guard = lock.lock().map_err(|_| PeerStoreError::LockPoisoned)?;

        let conn = self.pool.get()?;
        let Some(peer) = load_peer(&conn, fingerprint)? else {
            return Ok(None);
        };
        let mut state = peer
            .federation
            .unwrap_or_else(|| FederationState::pending(now_timestamp()));
        update(&mut state);
        state.updated_at = now_timestamp();
        if write_federation(&conn, fingerprint, &state)? {
            Ok(Some(state))
        } else {
            Ok(None)
        }
    }

    /// Deletes a peer record and returns what was deleted.
    ///
    /// Federation teardown is the caller's job and must happen first.
    pub fn remove_peer(&self, fingerprint: &str) -> Result<PeerRecord, PeerStoreError> {
        let lock = self.locks.lock_for(fingerprint);
        let _guard = lock.lock().map_err(|_| PeerStoreError::LockPoisoned)?;

        let conn = self.pool.get()?;
        let peer = load_peer(&conn, fingerprint)?
            .ok_or_else(|| PeerStoreError::NotFound(fingerprint.to_string()))?;
        conn.execute("DELETE FROM peers WHERE fingerprint = ?1", params![fingerprint])?;

        tracing::info!(
            fingerprint = %short_fingerprint(fingerprint),
            domain = %peer.domain,
            "peer removed"
        );
        record_or_warn(
            self.audit.as_ref(),
            fingerprint,
            &EventPayload::PeerRemoved {
                fingerprint: fingerprint.to_string(),
                domain: peer.domain.clone(),
            },
        );
        Ok(peer)
    }
}

fn write_federation(
    conn: &Connection,
    fingerprint: &str,
    state: &FederationState,
) -> Result<bool, PeerStoreError> {
    let json = serde_json::to_string(state)?;
    let changed = conn.execute(
        "UPDATE peers SET federation_json = ?2 WHERE fingerprint = ?1",
        params![fingerprint, json],
    )?;
    Ok(changed == 1)
}
