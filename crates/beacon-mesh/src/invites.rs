//! Single-use invites.
//!
//! An invite authorizes exactly one handshake. Redemption is serialized per
//! `invite_id` in process, and the `used` flag is flipped with a
//! conditional update so that even a second process sharing the database
//! cannot redeem the same invite twice.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use beacon_db::DbPool;
use beacon_identity::constant_time_eq;
use beacon_observe::{record_or_warn, AuditSink, EventPayload};
use beacon_types::{
    now_timestamp, BeaconIdentity, Invite, InviteSummary, InviteToken, INVITE_TOKEN_TYPE,
    MESH_VERSION,
};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::locks::KeyedLocks;

/// Errors produced by invite operations.
#[derive(Debug, Error)]
pub enum InviteError {
    #[error("invite not found")]
    NotFound,

    #[error("invite already used")]
    AlreadyUsed,

    #[error("invite secret mismatch")]
    SecretMismatch,

    #[error("invite expired")]
    Expired,

    #[error("invite database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invite pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("invite lock poisoned")]
    LockPoisoned,
}

/// Returns 32 random bytes as URL-safe base64 without padding.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

// ── Persistence ──────────────────────────────────────────────────────

/// Inserts a new invite row.
pub fn insert_invite(conn: &Connection, invite: &Invite) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO invites (invite_id, secret, created_at, used, used_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            invite.invite_id,
            invite.secret,
            invite.created_at,
            invite.used,
            invite.used_at
        ],
    )?;
    Ok(())
}

/// Loads an invite by id.
pub fn get_invite(conn: &Connection, invite_id: &str) -> Result<Option<Invite>, rusqlite::Error> {
    conn.query_row(
        "SELECT invite_id, secret, created_at, used, used_at FROM invites WHERE invite_id = ?1",
        params![invite_id],
        |row| {
            Ok(Invite {
                invite_id: row.get(0)?,
                secret: row.get(1)?,
                created_at: row.get(2)?,
                used: row.get(3)?,
                used_at: row.get(4)?,
            })
        },
    )
    .optional()
}

/// Flips `used` to true. Returns `false` if the invite was already used.
pub fn mark_invite_used(
    conn: &Connection,
    invite_id: &str,
    used_at: &str,
) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        "UPDATE invites SET used = 1, used_at = ?2 WHERE invite_id = ?1 AND used = 0",
        params![invite_id, used_at],
    )?;
    Ok(changed == 1)
}

/// Lists every invite, newest first.
pub fn list_invites(conn: &Connection) -> Result<Vec<Invite>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT invite_id, secret, created_at, used, used_at
         FROM invites ORDER BY created_at DESC, invite_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(Invite {
            invite_id: row.get(0)?,
            secret: row.get(1)?,
            created_at: row.get(2)?,
            used: row.get(3)?,
            used_at: row.get(4)?,
        })
    })?;
    rows.collect()
}

// ── Service ──────────────────────────────────────────────────────────

/// Issues and redeems invites.
#[derive(Clone)]
pub struct InviteService {
    pool: DbPool,
    locks: Arc<KeyedLocks>,
    audit: Arc<dyn AuditSink>,
    ttl: Option<Duration>,
}

impl InviteService {
    pub fn new(pool: DbPool, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            pool,
            locks: Arc::new(KeyedLocks::new()),
            audit,
            ttl: None,
        }
    }

    /// Makes invites expire `ttl` after creation.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Mints an invite and the token to hand to the remote operator.
    ///
    /// `mesh_url` is the public base URL of this beacon's mesh API.
    ///
    /// # Errors
    ///
    /// Returns [`InviteError::Database`] or [`InviteError::Pool`] on storage failure.
    pub fn create_invite(
        &self,
        identity: &BeaconIdentity,
        mesh_url: &str,
    ) -> Result<(Invite, InviteToken), InviteError> {
        let invite = Invite {
            invite_id: random_token(),
            secret: random_token(),
            created_at: now_timestamp(),
            used: false,
            used_at: None,
        };

        let conn = self.pool.get()?;
        insert_invite(&conn, &invite)?;

        tracing::info!(invite_id = %invite.invite_id, "created invite");
        record_or_warn(
            self.audit.as_ref(),
            &invite.invite_id,
            &EventPayload::InviteCreated {
                invite_id: invite.invite_id.clone(),
            },
        );

        let token = InviteToken {
            token_type: INVITE_TOKEN_TYPE.to_string(),
            version: MESH_VERSION.to_string(),
            invite_id: invite.invite_id.clone(),
            secret: invite.secret.clone(),
            origin_domain: identity.domain.clone(),
            origin_fingerprint: identity.fingerprint.clone(),
            mesh_url: mesh_url.trim_end_matches('/').to_string(),
        };
        Ok((invite, token))
    }

    /// Redeems an invite. Succeeds at most once per invite.
    ///
    /// # Errors
    ///
    /// - [`InviteError::NotFound`] if no invite has this id.
    /// - [`InviteError::AlreadyUsed`] if it was redeemed before.
    /// - [`InviteError::SecretMismatch`] if `secret` is wrong (audited as critical).
    /// - [`InviteError::Expired`] if a TTL is configured and has passed.
    pub fn verify_invite(&self, invite_id: &str, secret: &str) -> Result<Invite, InviteError> {
        let lock = self.locks.lock_for(invite_id);
        let _guard = lock.lock().map_err(|_| InviteError::LockPoisoned)?;

        let conn = self.pool.get()?;
        let Some(invite) = get_invite(&conn, invite_id)? else {
            self.reject(invite_id, "not found");
            return Err(InviteError::NotFound);
        };

        if invite.used {
            self.reject(invite_id, "already used");
            return Err(InviteError::AlreadyUsed);
        }

        if !constant_time_eq(invite.secret.as_bytes(), secret.as_bytes()) {
            tracing::error!(invite_id, "invite redemption with wrong secret");
            record_or_warn(
                self.audit.as_ref(),
                invite_id,
                &EventPayload::SecretMismatch {
                    invite_id: invite_id.to_string(),
                },
            );
            return Err(InviteError::SecretMismatch);
        }

        if self.is_expired(&invite) {
            self.reject(invite_id, "expired");
            return Err(InviteError::Expired);
        }

        let used_at = now_timestamp();
        if !mark_invite_used(&conn, invite_id, &used_at)? {
            self.reject(invite_id, "already used");
            return Err(InviteError::AlreadyUsed);
        }

        tracing::info!(invite_id, "invite redeemed");
        Ok(Invite {
            used: true,
            used_at: Some(used_at),
            ..invite
        })
    }

    /// Lists invites without their secrets.
    pub fn list_invites(&self) -> Result<Vec<InviteSummary>, InviteError> {
        let conn = self.pool.get()?;
        Ok(list_invites(&conn)?.iter().map(InviteSummary::from).collect())
    }

    /// Loads one invite including its secret.
    pub fn get_invite(&self, invite_id: &str) -> Result<Option<Invite>, InviteError> {
        let conn = self.pool.get()?;
        Ok(get_invite(&conn, invite_id)?)
    }

    fn is_expired(&self, invite: &Invite) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        let Ok(created) = chrono::DateTime::parse_from_rfc3339(&invite.created_at) else {
            tracing::warn!(invite_id = %invite.invite_id, "unparseable invite timestamp");
            return true;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        chrono::Utc::now() > created + ttl
    }

    fn reject(&self, invite_id: &str, reason: &str) {
        tracing::warn!(invite_id, reason, "invite redemption rejected");
        record_or_warn(
            self.audit.as_ref(),
            invite_id,
            &EventPayload::InviteRejected {
                invite_id: invite_id.to_string(),
                reason: reason.to_string(),
            },
        );
    }
}
