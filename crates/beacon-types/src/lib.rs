//! Shared types and constants for the beacon mesh.
//!
//! This crate holds the records that cross crate boundaries (identity,
//! invites, peer records) and the JSON bodies exchanged between beacons.
//! It has no I/O of its own so that every other crate can depend on it
//! without pulling in storage or networking.

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod peer;
mod wire;

pub use peer::{FederationState, FederationStatus, PeerRecord, PeerStatus, SanitizedPeer};
pub use wire::{
    FederationCredentials, FederationExchangeRequest, FederationExchangeResponse,
    HandshakeRequest, HandshakeResponse, HealthReport, PingResponse,
};

/// Protocol version advertised in identities, tokens and ping responses.
pub const MESH_VERSION: &str = "1.0";

/// Constant `type` tag carried by every invite token.
pub const INVITE_TOKEN_TYPE: &str = "mesh-invite";

/// Number of fingerprint hex characters used in slugs and log lines.
pub const SHORT_FINGERPRINT_LEN: usize = 12;

/// Error returned when a stored enum label is not recognised.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} label: {label}")]
pub struct ParseLabelError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The offending label.
    pub label: String,
}

/// The long-lived identity of a beacon.
///
/// Created once at first bring-up and never recreated. `fingerprint` is
/// always derived from `public_key`; it is never chosen by a remote party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconIdentity {
    /// Opaque stable identifier (UUID v4).
    pub beacon_id: String,
    /// Public hostname of the beacon.
    pub domain: String,
    /// Hex SHA-256 digest of the encoded public key.
    pub fingerprint: String,
    /// Base64-encoded Ed25519 verifying key.
    pub public_key: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Mesh protocol version at creation time.
    pub version: String,
    /// Public base URL of this beacon's mesh API, when advertised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_url: Option<String>,
}

impl BeaconIdentity {
    /// Returns the mesh API base URL, falling back to the domain convention.
    pub fn mesh_endpoint(&self) -> String {
        match &self.mesh_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => default_mesh_url(&self.domain),
        }
    }

    /// Returns the leading characters of the fingerprint.
    pub fn short_fingerprint(&self) -> &str {
        short_fingerprint(&self.fingerprint)
    }
}

/// Current UTC time as an RFC 3339 string with second precision.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Returns the conventional mesh API URL for a domain.
pub fn default_mesh_url(domain: &str) -> String {
    format!("https://{domain}/api/mesh")
}

/// Returns at most [`SHORT_FINGERPRINT_LEN`] leading characters of a fingerprint.
pub fn short_fingerprint(fingerprint: &str) -> &str {
    let end = fingerprint
        .char_indices()
        .nth(SHORT_FINGERPRINT_LEN)
        .map_or(fingerprint.len(), |(i, _)| i);
    &fingerprint[..end]
}

/// A persisted single-use invite.
///
/// `used` flips from `false` to `true` exactly once. Invites are never
/// deleted so they remain as an audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    pub invite_id: String,
    pub secret: String,
    pub created_at: String,
    pub used: bool,
    pub used_at: Option<String>,
}

/// An invite as listed to operators, without its secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteSummary {
    pub invite_id: String,
    pub created_at: String,
    pub used: bool,
    pub used_at: Option<String>,
}

impl From<&Invite> for InviteSummary {
    fn from(invite: &Invite) -> Self {
        Self {
            invite_id: invite.invite_id.clone(),
            created_at: invite.created_at.clone(),
            used: invite.used,
            used_at: invite.used_at.clone(),
        }
    }
}

/// The self-contained bundle handed to a remote operator out-of-band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteToken {
    /// Always [`INVITE_TOKEN_TYPE`] for a valid token.
    #[serde(rename = "type")]
    pub token_type: String,
    pub version: String,
    pub invite_id: String,
    pub secret: String,
    pub origin_domain: String,
    /// Fingerprint the responder of the handshake must present.
    pub origin_fingerprint: String,
    /// Base URL of the origin's mesh API.
    pub mesh_url: String,
}

/// States of the accepting-side handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandshakeState {
    TokenReceived,
    RequestSent,
    VerifiedRemote,
    PeerRecorded,
    FederationDispatched,
    /// The origin refused the invite.
    Rejected,
    /// The responder's identity did not match the token.
    SpoofDetected,
    /// Network or storage failure before completion.
    Failed,
}

impl HandshakeState {
    /// Returns the canonical label stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenReceived => "TOKEN_RECEIVED",
            Self::RequestSent => "REQUEST_SENT",
            Self::VerifiedRemote => "VERIFIED_REMOTE",
            Self::PeerRecorded => "PEER_RECORDED",
            Self::FederationDispatched => "FEDERATION_DISPATCHED",
            Self::Rejected => "REJECTED",
            Self::SpoofDetected => "SPOOF_DETECTED",
            Self::Failed => "FAILED",
        }
    }

    /// Whether no further transitions can happen from this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::FederationDispatched | Self::Rejected | Self::SpoofDetected | Self::Failed
        )
    }
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HandshakeState {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOKEN_RECEIVED" => Ok(Self::TokenReceived),
            "REQUEST_SENT" => Ok(Self::RequestSent),
            "VERIFIED_REMOTE" => Ok(Self::VerifiedRemote),
            "PEER_RECORDED" => Ok(Self::PeerRecorded),
            "FEDERATION_DISPATCHED" => Ok(Self::FederationDispatched),
            "REJECTED" => Ok(Self::Rejected),
            "SPOOF_DETECTED" => Ok(Self::SpoofDetected),
            "FAILED" => Ok(Self::Failed),
            _ => Err(ParseLabelError {
                kind: "handshake state",
                label: s.to_string(),
            }),
        }
    }
}

/// A durable record of one accepting-side handshake run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeJob {
    pub job_id: String,
    pub invite_id: String,
    pub origin_domain: String,
    pub origin_fingerprint: String,
    pub state: HandshakeState,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}
