//! Peer records and their federation sub-state.

use serde::{Deserialize, Serialize};

use crate::{BeaconIdentity, ParseLabelError};

/// Reachability of a peer as last observed by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Active,
    Unreachable,
}

impl PeerStatus {
    /// Returns the canonical label stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Unreachable => "unreachable",
        }
    }
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PeerStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "unreachable" => Ok(Self::Unreachable),
            _ => Err(ParseLabelError {
                kind: "peer status",
                label: s.to_string(),
            }),
        }
    }
}

/// Outcome of federation configuration for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FederationStatus {
    /// Configuration has been dispatched and has not finished.
    Pending,
    /// Every step succeeded.
    Active,
    /// At least one step failed; see `last_error`.
    Failed,
}

/// Identity-federation objects created on this beacon for a peer.
///
/// Any field may be absent when a step failed part-way through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationState {
    pub status: FederationStatus,
    /// Inbound source pointing at the peer's identity provider.
    #[serde(default)]
    pub source_id: Option<String>,
    /// Outbound provider representing the peer.
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub application_slug: Option<String>,
    /// Client ID of the outbound provider.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Client secret of the outbound provider. Never leaves this beacon
    /// except through the signed credential exchange.
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: String,
}

impl FederationState {
    /// A fresh record in the `PENDING` state.
    pub fn pending(now: String) -> Self {
        Self {
            status: FederationStatus::Pending,
            source_id: None,
            provider_id: None,
            application_slug: None,
            client_id: None,
            client_secret: None,
            last_error: None,
            updated_at: now,
        }
    }
}

/// A trusted peer, keyed uniquely by fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub beacon_id: String,
    pub domain: String,
    pub fingerprint: String,
    pub public_key: String,
    /// Base URL of the peer's mesh API.
    pub mesh_url: String,
    pub peered_at: String,
    pub status: PeerStatus,
    pub last_check: Option<String>,
    pub last_check_status: Option<String>,
    pub federation: Option<FederationState>,
}

impl PeerRecord {
    /// Reconstructs the identity the peer presented during the handshake.
    pub fn identity(&self) -> BeaconIdentity {
        BeaconIdentity {
            beacon_id: self.beacon_id.clone(),
            domain: self.domain.clone(),
            fingerprint: self.fingerprint.clone(),
            public_key: self.public_key.clone(),
            created_at: self.peered_at.clone(),
            version: crate::MESH_VERSION.to_string(),
            mesh_url: Some(self.mesh_url.clone()),
        }
    }

    /// Projects the record onto the fields that may leave this beacon.
    pub fn sanitized(&self) -> SanitizedPeer {
        SanitizedPeer {
            beacon_id: self.beacon_id.clone(),
            domain: self.domain.clone(),
            fingerprint: self.fingerprint.clone(),
            peered_at: self.peered_at.clone(),
            status: self.status,
            last_check: self.last_check.clone(),
            federation_status: self.federation.as_ref().map(|f| f.status),
        }
    }
}

/// The only peer projection exposed through the mesh API.
///
/// Contains no secrets, no client credentials and no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizedPeer {
    pub beacon_id: String,
    pub domain: String,
    pub fingerprint: String,
    pub peered_at: String,
    pub status: PeerStatus,
    pub last_check: Option<String>,
    pub federation_status: Option<FederationStatus>,
}
