//! Event domain, severity, payload, and record types for the audit log.

use serde::{Deserialize, Serialize};

use beacon_types::ParseLabelError;

/// Audit event domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventDomain {
    /// Invite creation and redemption.
    Invite,
    /// Peer record lifecycle.
    Peer,
    /// Accepting-side and origin-side handshake outcomes.
    Handshake,
    /// Identity-federation configuration and credential exchange.
    Federation,
    /// Reachability transitions observed by the health monitor.
    Health,
}

impl EventDomain {
    /// Returns the canonical string label for this domain.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invite => "INVITE",
            Self::Peer => "PEER",
            Self::Handshake => "HANDSHAKE",
            Self::Federation => "FEDERATION",
            Self::Health => "HEALTH",
        }
    }
}

impl std::fmt::Display for EventDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventDomain {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INVITE" => Ok(Self::Invite),
            "PEER" => Ok(Self::Peer),
            "HANDSHAKE" => Ok(Self::Handshake),
            "FEDERATION" => Ok(Self::Federation),
            "HEALTH" => Ok(Self::Health),
            _ => Err(ParseLabelError {
                kind: "event domain",
                label: s.to_string(),
            }),
        }
    }
}

/// How urgently an operator should look at an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    /// Security alert: forged identities, wrong secrets.
    Critical,
}

impl Severity {
    /// Returns the canonical string label for this severity.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Structured payloads, one variant per event type.
///
/// Serialised to JSON into `audit_log.payload_json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    // ── Invite domain ────────────────────────────────────────────────
    /// A new invite was minted.
    InviteCreated { invite_id: String },

    /// An invite was redeemed by a peer.
    InviteRedeemed {
        invite_id: String,
        peer_fingerprint: String,
    },

    /// A redemption was refused (unknown, already used, expired).
    InviteRejected { invite_id: String, reason: String },

    /// A redemption presented the wrong secret.
    SecretMismatch { invite_id: String },

    // ── Peer domain ──────────────────────────────────────────────────
    /// A peer record was created.
    PeerAdded {
        fingerprint: String,
        beacon_id: String,
        domain: String,
    },

    /// An operator removed a peer.
    PeerRemoved { fingerprint: String, domain: String },

    /// A handshake tried to record this beacon as its own peer.
    SelfPeeringRejected { beacon_id: String },

    // ── Handshake domain ─────────────────────────────────────────────
    /// The accepting side finished a handshake.
    HandshakeCompleted {
        origin_domain: String,
        origin_fingerprint: String,
    },

    /// The origin refused our handshake.
    HandshakeRejected { origin_domain: String, status: u16 },

    /// The handshake could not complete (network or storage).
    HandshakeFailed { origin_domain: String, reason: String },

    /// The responder's identity did not match what the invite promised.
    SpoofDetected {
        expected_fingerprint: String,
        presented_fingerprint: String,
        mesh_url: String,
        reason: String,
    },

    /// An inbound handshake carried an identity that failed verification.
    InvalidPeerIdentity { fingerprint: String, reason: String },

    // ── Federation domain ────────────────────────────────────────────
    /// All federation steps succeeded for a peer.
    FederationConfigured { fingerprint: String },

    /// A federation step failed.
    FederationFailed {
        fingerprint: String,
        step: String,
        reason: String,
    },

    /// A peer pushed its outbound credentials to us.
    FederationCredentialsReceived { fingerprint: String },

    /// A credential push was refused.
    FederationExchangeRejected { fingerprint: String, reason: String },

    /// Federation objects for a removed peer were deleted.
    FederationTornDown { fingerprint: String, failures: usize },

    // ── Health domain ────────────────────────────────────────────────
    /// A previously reachable peer stopped answering.
    PeerUnreachable { fingerprint: String, detail: String },

    /// An unreachable peer answered again.
    PeerRecovered { fingerprint: String },
}

impl EventPayload {
    /// Returns the canonical event type string for this payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::InviteCreated { .. } => "INVITE_CREATED",
            Self::InviteRedeemed { .. } => "INVITE_REDEEMED",
            Self::InviteRejected { .. } => "INVITE_REJECTED",
            Self::SecretMismatch { .. } => "SECRET_MISMATCH",
            Self::PeerAdded { .. } => "PEER_ADDED",
            Self::PeerRemoved { .. } => "PEER_REMOVED",
            Self::SelfPeeringRejected { .. } => "SELF_PEERING_REJECTED",
            Self::HandshakeCompleted { .. } => "HANDSHAKE_COMPLETED",
            Self::HandshakeRejected { .. } => "HANDSHAKE_REJECTED",
            Self::HandshakeFailed { .. } => "HANDSHAKE_FAILED",
            Self::SpoofDetected { .. } => "SPOOF_DETECTED",
            Self::InvalidPeerIdentity { .. } => "INVALID_PEER_IDENTITY",
            Self::FederationConfigured { .. } => "FEDERATION_CONFIGURED",
            Self::FederationFailed { .. } => "FEDERATION_FAILED",
            Self::FederationCredentialsReceived { .. } => "FEDERATION_CREDENTIALS_RECEIVED",
            Self::FederationExchangeRejected { .. } => "FEDERATION_EXCHANGE_REJECTED",
            Self::FederationTornDown { .. } => "FEDERATION_TORN_DOWN",
            Self::PeerUnreachable { .. } => "PEER_UNREACHABLE",
            Self::PeerRecovered { .. } => "PEER_RECOVERED",
        }
    }

    /// Returns the domain for this payload.
    pub fn domain(&self) -> EventDomain {
        match self {
            Self::InviteCreated { .. }
            | Self::InviteRedeemed { .. }
            | Self::InviteRejected { .. }
            | Self::SecretMismatch { .. } => EventDomain::Invite,
            Self::PeerAdded { .. } | Self::PeerRemoved { .. } | Self::SelfPeeringRejected { .. } => {
                EventDomain::Peer
            }
            Self::HandshakeCompleted { .. }
            | Self::HandshakeRejected { .. }
            | Self::HandshakeFailed { .. }
            | Self::SpoofDetected { .. }
            | Self::InvalidPeerIdentity { .. } => EventDomain::Handshake,
            Self::FederationConfigured { .. }
            | Self::FederationFailed { .. }
            | Self::FederationCredentialsReceived { .. }
            | Self::FederationExchangeRejected { .. }
            | Self::FederationTornDown { .. } => EventDomain::Federation,
            Self::PeerUnreachable { .. } | Self::PeerRecovered { .. } => EventDomain::Health,
        }
    }

    /// Returns the severity for this payload.
    pub fn severity(&self) -> Severity {
        match self {
            Self::SecretMismatch { .. }
            | Self::SpoofDetected { .. }
            | Self::InvalidPeerIdentity { .. }
            | Self::FederationExchangeRejected { .. } => Severity::Critical,
            Self::InviteRejected { .. }
            | Self::SelfPeeringRejected { .. }
            | Self::HandshakeRejected { .. }
            | Self::HandshakeFailed { .. }
            | Self::FederationFailed { .. }
            | Self::PeerUnreachable { .. } => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

/// A single row from the `audit_log` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    /// Monotonically increasing position in the log.
    pub seq: i64,
    pub domain: String,
    pub event_type: String,
    pub severity: String,
    /// Fingerprint, invite ID or domain the event is about.
    pub entity_id: String,
    pub payload_json: String,
    pub occurred_at: String,
}
