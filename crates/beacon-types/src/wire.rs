//! JSON bodies exchanged between beacons.

use serde::{Deserialize, Serialize};

use crate::BeaconIdentity;

/// Body of `POST handshake`, sent by the accepting side to the origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub invite_id: String,
    pub secret: String,
    /// Identity of the beacon redeeming the invite.
    pub peer_identity: BeaconIdentity,
    /// Hex Ed25519 signature over the handshake request message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Successful handshake response from the origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Identity of the origin beacon.
    pub peer_identity: BeaconIdentity,
    /// Hex Ed25519 signature over the handshake acknowledgement message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// OIDC client credentials for a federation provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub issuer: String,
    pub authorization_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub jwks_url: String,
}

/// Body of `POST federation-exchange`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationExchangeRequest {
    /// Identity of the beacon pushing the credentials.
    pub identity: BeaconIdentity,
    pub federation_credentials: FederationCredentials,
    /// Hex Ed25519 signature over the exchange message.
    #[serde(default)]
    pub signature: Option<String>,
}

/// Acknowledgement of `POST federation-exchange`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationExchangeResponse {
    pub status: String,
}

/// Body of `GET ping`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: String,
    pub beacon_id: String,
    pub fingerprint: String,
    pub mesh_version: String,
    pub timestamp: String,
    pub peer_count: usize,
}

/// Tally produced by one health-check pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub checked_at: String,
}
