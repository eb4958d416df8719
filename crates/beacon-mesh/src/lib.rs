//! The beacon mesh: invite-based peering between independently run beacons.
//!
//! Trust is only ever established through an explicit invite minted by an
//! operator. There is no discovery, gossip or consensus.
//!
//! - [`InviteService`] mints and redeems single-use invites.
//! - [`PeerStore`] keeps fingerprint-keyed peer records.
//! - [`HandshakeProtocol`] runs both halves of the handshake.
//! - [`FederationConfigurator`] sets up identity-provider trust per peer.
//! - [`HealthMonitor`] probes peers for reachability.
//!
//! [`Mesh::bring_up`] wires all of these together over one database.

pub mod client;
pub mod federation;
pub mod handshake;
pub mod health;
pub mod idp;
pub mod invites;
pub mod jobs;
pub mod locks;
pub mod peers;
pub mod token;

use std::sync::Arc;
use std::time::Duration;

use beacon_db::{DbPool, KeyValueStore};
use beacon_identity::{IdentityError, IdentityManager};
use beacon_observe::AuditSink;
use beacon_types::BeaconIdentity;

pub use client::{ClientTimeouts, HttpMeshClient, MeshClient, MeshClientError};
pub use federation::{
    federation_slug, ApplicationConfig, DisabledIdentityProvider, FederationConfigurator,
    FederationError, FederationSettings, IdentityProviderAdmin, ObjectKind, ProviderConfig,
    SourceConfig,
};
pub use handshake::{HandshakeError, HandshakeProtocol};
pub use health::{HealthError, HealthMonitor};
pub use idp::AuthentikAdmin;
pub use invites::{InviteError, InviteService};
pub use peers::{AddPeerOutcome, PeerStore, PeerStoreError};
pub use token::{decode_invite_token, encode_invite_token, TokenError};

/// Everything [`Mesh::bring_up`] needs from the host process.
pub struct MeshDeps {
    pub pool: DbPool,
    pub settings: Arc<dyn KeyValueStore>,
    pub audit: Arc<dyn AuditSink>,
    pub client: Arc<dyn MeshClient>,
    pub idp: Arc<dyn IdentityProviderAdmin>,
    /// Public hostname of this beacon.
    pub domain: String,
    /// Public base URL of this beacon's mesh API.
    pub mesh_url: String,
    /// Public base URL of this beacon's identity provider.
    pub idp_public_url: String,
    pub invite_ttl: Option<Duration>,
}

/// The assembled mesh services of one beacon.
#[derive(Clone)]
pub struct Mesh {
    pub identity: IdentityManager,
    pub invites: InviteService,
    pub peers: PeerStore,
    pub handshake: HandshakeProtocol,
    pub federation: FederationConfigurator,
    pub health: HealthMonitor,
    pub mesh_url: String,
}

impl Mesh {
    /// Ensures the beacon identity exists and builds the services around it.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the identity cannot be created or read.
    pub fn bring_up(deps: MeshDeps) -> Result<(Self, BeaconIdentity), IdentityError> {
        let identity = IdentityManager::new(deps.settings, deps.domain);
        let own = identity.ensure_identity()?;
        let mesh_url = deps.mesh_url.trim_end_matches('/').to_string();

        let invites =
            InviteService::new(deps.pool.clone(), deps.audit.clone()).with_ttl(deps.invite_ttl);
        let peers = PeerStore::new(deps.pool.clone(), own.beacon_id.clone(), deps.audit.clone());
        let federation = FederationConfigurator::new(
            deps.idp,
            peers.clone(),
            identity.clone(),
            deps.client.clone(),
            deps.audit.clone(),
            FederationSettings {
                mesh_url: mesh_url.clone(),
                idp_public_url: deps.idp_public_url,
            },
        );
        let handshake = HandshakeProtocol::new(
            deps.pool,
            identity.clone(),
            invites.clone(),
            peers.clone(),
            federation.clone(),
            deps.client.clone(),
            deps.audit.clone(),
            &mesh_url,
        );
        let health = HealthMonitor::new(peers.clone(), deps.client, deps.audit);

        tracing::info!(
            beacon_id = %own.beacon_id,
            fingerprint = %own.short_fingerprint(),
            mesh_url = %mesh_url,
            "mesh services ready"
        );

        Ok((
            Self {
                identity,
                invites,
                peers,
                handshake,
                federation,
                health,
                mesh_url,
            },
            own,
        ))
    }
}
