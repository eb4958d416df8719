//! Invite-based handshake between two beacons.
//!
//! The **accepting** side (the beacon redeeming a token) runs a durable job:
//!
//! ```text
//! TOKEN_RECEIVED → REQUEST_SENT → VERIFIED_REMOTE → PEER_RECORDED → FEDERATION_DISPATCHED
//!                        │               │
//!                        ├→ REJECTED     └→ SPOOF_DETECTED
//!                        └→ FAILED
//! ```
//!
//! The **origin** side (the beacon that minted the invite) answers a single
//! request in [`HandshakeProtocol::handle_handshake`].
//!
//! The responder's identity is checked against the fingerprint promised in
//! the token. The token travels out-of-band and may be relayed to an
//! attacker's endpoint; this comparison is the only defence against that.

use std::sync::Arc;

use beacon_db::DbPool;
use beacon_identity::{
    constant_time_eq, verify_identity_fingerprint, verify_signature, IdentityError,
    IdentityManager, SignatureProvider,
};
use beacon_observe::{record_or_warn_async, AuditSink, EventPayload};
use beacon_types::{
    short_fingerprint, BeaconIdentity, HandshakeJob, HandshakeRequest, HandshakeResponse,
    HandshakeState, InviteToken,
};
use thiserror::Error;

use crate::client::{MeshClient, MeshClientError};
use crate::federation::FederationConfigurator;
use crate::invites::{InviteError, InviteService};
use crate::jobs;
use crate::peers::{AddPeerOutcome, PeerStore, PeerStoreError};
use crate::token::{decode_invite_token, TokenError};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("beacon identity is not configured")]
    NotConfigured,

    #[error(transparent)]
    Identity(IdentityError),

    #[error("invalid peer identity: {0}")]
    InvalidPeerIdentity(String),

    #[error("refusing to peer with self")]
    SelfPeering,

    #[error(transparent)]
    Invite(#[from] InviteError),

    #[error(transparent)]
    Peers(#[from] PeerStoreError),

    #[error("handshake job not found: {0}")]
    JobNotFound(String),

    #[error("handshake database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("handshake pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<IdentityError> for HandshakeError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::NotConfigured => Self::NotConfigured,
            other => Self::Identity(other),
        }
    }
}

/// Message the accepting side signs in its request.
pub fn request_message(invite_id: &str, fingerprint: &str) -> String {
    format!("mesh-handshake:{invite_id}:{fingerprint}")
}

/// Message the origin signs in its response.
pub fn ack_message(invite_id: &str, fingerprint: &str) -> String {
    format!("mesh-handshake-ack:{invite_id}:{fingerprint}")
}

/// Why the accepting side stopped.
enum Abort {
    Rejected(String),
    Spoof(String),
    Failed(String),
}

/// Both halves of the handshake.
#[derive(Clone)]
pub struct HandshakeProtocol {
    pool: DbPool,
    identity: IdentityManager,
    invites: InviteService,
    peers: PeerStore,
    federation: FederationConfigurator,
    client: Arc<dyn MeshClient>,
    audit: Arc<dyn AuditSink>,
    mesh_url: Arc<str>,
}

impl HandshakeProtocol {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: DbPool,
        identity: IdentityManager,
        invites: InviteService,
        peers: PeerStore,
        federation: FederationConfigurator,
        client: Arc<dyn MeshClient>,
        audit: Arc<dyn AuditSink>,
        mesh_url: &str,
    ) -> Self {
        Self {
            pool,
            identity,
            invites,
            peers,
            federation,
            client,
            audit,
            mesh_url: Arc::from(mesh_url.trim_end_matches('/')),
        }
    }

    // ── Accepting side ───────────────────────────────────────────────

    /// Validates a transported token and records a job for it.
    ///
    /// Nothing is sent over the network yet.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Token`] for a malformed token and
    /// [`HandshakeError::NotConfigured`] if this beacon has no identity.
    pub async fn begin_accept(
        &self,
        encoded_token: &str,
    ) -> Result<(HandshakeJob, InviteToken), HandshakeError> {
        let token = decode_invite_token(encoded_token)?;
        self.identity.get_identity()?;

        let pool = self.pool.clone();
        let stored = token.clone();
        let job = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            Ok::<_, HandshakeError>(jobs::insert_job(&conn, &stored)?)
        })
        .await??;

        tracing::info!(
            job_id = %job.job_id,
            origin = %token.origin_domain,
            "accepted invite token"
        );
        Ok((job, token))
    }

    /// Validates a token, records a job, and runs it in the background.
    ///
    /// # Errors
    ///
    /// See [`begin_accept`](Self::begin_accept).
    pub async fn accept_invite(&self, encoded_token: &str) -> Result<HandshakeJob, HandshakeError> {
        let (job, token) = self.begin_accept(encoded_token).await?;
        let this = self.clone();
        let job_id = job.job_id.clone();
        tokio::spawn(async move {
            this.run_accept(&job_id, &token).await;
        });
        Ok(job)
    }

    /// Drives one accepting-side job to a terminal state and returns it.
    pub async fn run_accept(&self, job_id: &str, token: &InviteToken) -> HandshakeState {
        let (state, error) = match self.accept_steps(job_id, token).await {
            Ok(()) => (HandshakeState::FederationDispatched, None),
            Err(Abort::Rejected(reason)) => (HandshakeState::Rejected, Some(reason)),
            Err(Abort::Spoof(reason)) => (HandshakeState::SpoofDetected, Some(reason)),
            Err(Abort::Failed(reason)) => (HandshakeState::Failed, Some(reason)),
        };
        self.set_state(job_id, state, error.as_deref()).await;
        state
    }

    async fn accept_steps(&self, job_id: &str, token: &InviteToken) -> Result<(), Abort> {
        let own = self
            .identity
            .advertised(&self.mesh_url)
            .map_err(|e| Abort::Failed(e.to_string()))?;
        let signer = self
            .identity
            .signer()
            .map_err(|e| Abort::Failed(e.to_string()))?;

        let request = HandshakeRequest {
            invite_id: token.invite_id.clone(),
            secret: token.secret.clone(),
            signature: Some(signer.sign(
                request_message(&token.invite_id, &own.fingerprint).as_bytes(),
            )),
            peer_identity: own,
        };

        self.set_state(job_id, HandshakeState::RequestSent, None).await;
        let response = match self.client.handshake(&token.mesh_url, &request).await {
            Ok(response) => response,
            Err(MeshClientError::Rejected { status, body }) => {
                tracing::warn!(origin = %token.origin_domain, status, "handshake rejected by origin");
                self.audit(
                    &token.origin_fingerprint,
                    EventPayload::HandshakeRejected {
                        origin_domain: token.origin_domain.clone(),
                        status,
                    },
                )
                .await;
                return Err(Abort::Rejected(format!("origin returned {status}: {body}")));
            }
            Err(e) => return Err(self.accept_failed(token, e.to_string()).await),
        };

        let mut origin = response.peer_identity;
        self.verify_responder(token, &origin, response.signature.as_deref())
            .await?;
        self.set_state(job_id, HandshakeState::VerifiedRemote, None).await;

        // Store the address we actually reached, not the one the responder claims.
        origin.mesh_url = Some(token.mesh_url.clone());
        let peers = self.peers.clone();
        let outcome = match tokio::task::spawn_blocking(move || peers.add_peer(&origin)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(self.accept_failed(token, e.to_string()).await),
            Err(e) => return Err(self.accept_failed(token, e.to_string()).await),
        };
        if outcome == AddPeerOutcome::SelfRejected {
            return Err(self
                .accept_failed(token, "invite was issued by this beacon".to_string())
                .await);
        }
        self.set_state(job_id, HandshakeState::PeerRecorded, None).await;

        tracing::info!(
            origin = %token.origin_domain,
            fingerprint = %short_fingerprint(&token.origin_fingerprint),
            "handshake completed"
        );
        self.audit(
            &token.origin_fingerprint,
            EventPayload::HandshakeCompleted {
                origin_domain: token.origin_domain.clone(),
                origin_fingerprint: token.origin_fingerprint.clone(),
            },
        )
        .await;

        if outcome == AddPeerOutcome::Inserted {
            self.federation.dispatch(token.origin_fingerprint.clone());
        } else {
            tracing::debug!(
                fingerprint = %short_fingerprint(&token.origin_fingerprint),
                "peer already known, federation left as is"
            );
        }
        Ok(())
    }

    /// Checks the responder is the beacon the token promised.
    async fn verify_responder(
        &self,
        token: &InviteToken,
        origin: &BeaconIdentity,
        signature: Option<&str>,
    ) -> Result<(), Abort> {
        let reason = if !constant_time_eq(
            origin.fingerprint.as_bytes(),
            token.origin_fingerprint.as_bytes(),
        ) {
            Some("responder fingerprint does not match invite".to_string())
        } else if let Err(e) = verify_identity_fingerprint(origin) {
            Some(e.to_string())
        } else {
            match signature {
                None => Some("responder did not sign the acknowledgement".to_string()),
                Some(sig) => verify_signature(
                    &origin.public_key,
                    ack_message(&token.invite_id, &origin.fingerprint).as_bytes(),
                    sig,
                )
                .err()
                .map(|e| e.to_string()),
            }
        };

        let Some(reason) = reason else {
            return Ok(());
        };
        tracing::error!(
            expected = %short_fingerprint(&token.origin_fingerprint),
            presented = %short_fingerprint(&origin.fingerprint),
            mesh_url = %token.mesh_url,
            reason = %reason,
            "spoofed handshake response"
        );
        self.audit(
            &token.origin_fingerprint,
            EventPayload::SpoofDetected {
                expected_fingerprint: token.origin_fingerprint.clone(),
                presented_fingerprint: origin.fingerprint.clone(),
                mesh_url: token.mesh_url.clone(),
                reason: reason.clone(),
            },
        )
        .await;
        Err(Abort::Spoof(reason))
    }

    async fn accept_failed(&self, token: &InviteToken, reason: String) -> Abort {
        tracing::warn!(origin = %token.origin_domain, "handshake failed: {}", reason);
        self.audit(
            &token.origin_fingerprint,
            EventPayload::HandshakeFailed {
                origin_domain: token.origin_domain.clone(),
                reason: reason.clone(),
            },
        )
        .await;
        Abort::Failed(reason)
    }

    async fn audit(&self, entity_id: &str, payload: EventPayload) {
        record_or_warn_async(Arc::clone(&self.audit), entity_id, payload).await;
    }

    async fn set_state(&self, job_id: &str, state: HandshakeState, error: Option<&str>) {
        let pool = self.pool.clone();
        let id = job_id.to_string();
        let error = error.map(str::to_string);
        let result = tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| e.to_string())?;
            jobs::update_job_state(&conn, &id, state, error.as_deref()).map_err(|e| e.to_string())
        })
        .await
        .unwrap_or_else(|e| Err(e.to_string()));
        if let Err(e) = result {
            tracing::warn!(job_id, state = state.as_str(), "failed to persist job state: {}", e);
        }
    }

    /// Loads a handshake job.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::JobNotFound`] for an unknown id.
    pub async fn get_job(&self, job_id: &str) -> Result<HandshakeJob, HandshakeError> {
        let pool = self.pool.clone();
        let id = job_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            Ok::<_, HandshakeError>(jobs::get_job(&conn, &id)?)
        })
        .await??
        .ok_or_else(|| HandshakeError::JobNotFound(job_id.to_string()))
    }

    // ── Origin side ──────────────────────────────────────────────────

    /// Answers a handshake request from a beacon redeeming our invite.
    ///
    /// The invite is consumed only after the requester's identity and
    /// signature check out.
    ///
    /// # Errors
    ///
    /// - [`HandshakeError::SelfPeering`] if the requester is this beacon.
    /// - [`HandshakeError::InvalidPeerIdentity`] for a forged fingerprint or bad signature.
    /// - [`HandshakeError::Invite`] if redemption fails.
    pub async fn handle_handshake(
        &self,
        request: HandshakeRequest,
    ) -> Result<HandshakeResponse, HandshakeError> {
        let own = self.identity.get_identity()?;
        let requester = request.peer_identity;

        if requester.beacon_id == own.beacon_id || requester.fingerprint == own.fingerprint {
            tracing::warn!(invite_id = %request.invite_id, "handshake from self rejected");
            self.audit(
                &requester.beacon_id,
                EventPayload::SelfPeeringRejected {
                    beacon_id: requester.beacon_id.clone(),
                },
            )
            .await;
            return Err(HandshakeError::SelfPeering);
        }

        let check = verify_identity_fingerprint(&requester).and_then(|()| {
            let sig = request.signature.as_deref().ok_or_else(|| {
                IdentityError::InvalidSignature("missing request signature".to_string())
            })?;
            verify_signature(
                &requester.public_key,
                request_message(&request.invite_id, &requester.fingerprint).as_bytes(),
                sig,
            )
        });
        if let Err(e) = check {
            tracing::error!(
                fingerprint = %short_fingerprint(&requester.fingerprint),
                "invalid identity in handshake request: {}",
                e
            );
            self.audit(
                &requester.fingerprint,
                EventPayload::InvalidPeerIdentity {
                    fingerprint: requester.fingerprint.clone(),
                    reason: e.to_string(),
                },
            )
            .await;
            return Err(HandshakeError::InvalidPeerIdentity(e.to_string()));
        }

        let invites = self.invites.clone();
        let (invite_id, secret) = (request.invite_id.clone(), request.secret);
        tokio::task::spawn_blocking(move || invites.verify_invite(&invite_id, &secret)).await??;

        self.audit(
            &request.invite_id,
            EventPayload::InviteRedeemed {
                invite_id: request.invite_id.clone(),
                peer_fingerprint: requester.fingerprint.clone(),
            },
        )
        .await;

        let peers = self.peers.clone();
        let stored = requester.clone();
        let outcome = tokio::task::spawn_blocking(move || peers.add_peer(&stored)).await??;

        let identity = self.identity.advertised(&self.mesh_url)?;
        let signer = self.identity.signer()?;
        let response = HandshakeResponse {
            signature: Some(signer.sign(
                ack_message(&request.invite_id, &identity.fingerprint).as_bytes(),
            )),
            peer_identity: identity,
        };

        if outcome == AddPeerOutcome::Inserted {
            self.federation.dispatch(requester.fingerprint.clone());
        }
        tracing::info!(
            peer = %requester.domain,
            fingerprint = %short_fingerprint(&requester.fingerprint),
            "answered handshake"
        );
        Ok(response)
    }
}
