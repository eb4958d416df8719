//! Shared fixtures: in-process beacons wired through a loopback client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_db::{open_database, PoolSettings, SqliteKvStore};
use beacon_mesh::{
    ApplicationConfig, FederationError, HandshakeError, IdentityProviderAdmin, InviteError, Mesh,
    MeshClient, MeshClientError, MeshDeps, ObjectKind, ProviderConfig, SourceConfig,
};
use beacon_observe::MemoryAuditSink;
use beacon_types::{
    now_timestamp, BeaconIdentity, FederationExchangeRequest, FederationExchangeResponse,
    FederationState, FederationStatus, HandshakeRequest, HandshakeResponse, PingResponse,
    MESH_VERSION,
};

// ── Fake identity provider ───────────────────────────────────────────

/// In-memory identity provider with Authentik's source semantics: the slug
/// is the id and a second source under a live slug is rejected.
#[derive(Default)]
pub struct FakeIdp {
    next_id: AtomicU64,
    pub fail: AtomicBool,
    /// Delay applied to every `create_source` call.
    pub source_delay_ms: AtomicU64,
    /// `create_source` fails for this client id.
    pub reject_client_id: Mutex<Option<String>>,
    /// Every source ever created, in order.
    pub sources: Mutex<Vec<SourceConfig>>,
    live_sources: Mutex<HashMap<String, SourceConfig>>,
    pub providers: Mutex<Vec<ProviderConfig>>,
    pub applications: Mutex<Vec<ApplicationConfig>>,
    pub deleted: Mutex<Vec<(ObjectKind, String)>>,
}

impl FakeIdp {
    pub fn failing() -> Self {
        let idp = Self::default();
        idp.fail.store(true, Ordering::SeqCst);
        idp
    }

    /// The source currently stored under `slug`.
    pub fn live_source(&self, slug: &str) -> Option<SourceConfig> {
        self.live_sources.lock().unwrap().get(slug).cloned()
    }

    fn check(&self) -> Result<(), FederationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FederationError::Api("fake idp is down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProviderAdmin for FakeIdp {
    async fn create_source(&self, config: &SourceConfig) -> Result<String, FederationError> {
        let delay = self.source_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check()?;
        if self.reject_client_id.lock().unwrap().as_deref() == Some(config.client_id.as_str()) {
            return Err(FederationError::Api("source rejected".to_string()));
        }
        let mut live = self.live_sources.lock().unwrap();
        if live.contains_key(&config.slug) {
            return Err(FederationError::Api(format!(
                "status 400: source with this slug already exists: {}",
                config.slug
            )));
        }
        live.insert(config.slug.clone(), config.clone());
        self.sources.lock().unwrap().push(config.clone());
        Ok(config.slug.clone())
    }

    async fn create_provider(&self, config: &ProviderConfig) -> Result<String, FederationError> {
        self.check()?;
        self.providers.lock().unwrap().push(config.clone());
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst).to_string())
    }

    async fn create_application(
        &self,
        config: &ApplicationConfig,
    ) -> Result<String, FederationError> {
        self.check()?;
        self.applications.lock().unwrap().push(config.clone());
        Ok(config.slug.clone())
    }

    async fn delete(&self, kind: ObjectKind, id: &str) -> Result<(), FederationError> {
        self.check()?;
        if kind == ObjectKind::Source {
            self.live_sources.lock().unwrap().remove(id);
        }
        self.deleted.lock().unwrap().push((kind, id.to_string()));
        Ok(())
    }
}

// ── Loopback transport ───────────────────────────────────────────────

/// Routes mesh calls straight into other in-process beacons by mesh URL.
#[derive(Default)]
pub struct Loopback {
    beacons: Mutex<HashMap<String, Mesh>>,
}

impl Loopback {
    pub fn register(&self, mesh: &Mesh) {
        self.beacons
            .lock()
            .unwrap()
            .insert(mesh.mesh_url.clone(), mesh.clone());
    }

    fn lookup(&self, mesh_url: &str) -> Result<Mesh, MeshClientError> {
        self.beacons
            .lock()
            .unwrap()
            .get(mesh_url.trim_end_matches('/'))
            .cloned()
            .ok_or_else(|| MeshClientError::Decode(format!("no beacon at {mesh_url}")))
    }
}

fn handshake_status(e: &HandshakeError) -> u16 {
    match e {
        HandshakeError::Invite(InviteError::NotFound) => 404,
        HandshakeError::Invite(
            InviteError::AlreadyUsed | InviteError::SecretMismatch | InviteError::Expired,
        ) => 403,
        HandshakeError::SelfPeering | HandshakeError::InvalidPeerIdentity(_) => 400,
        _ => 500,
    }
}

fn federation_status(e: &FederationError) -> u16 {
    match e {
        FederationError::UnknownPeer(_) => 404,
        FederationError::InvalidIdentity(_) | FederationError::InvalidSignature(_) => 400,
        _ => 500,
    }
}

#[async_trait]
impl MeshClient for Loopback {
    async fn handshake(
        &self,
        mesh_url: &str,
        request: &HandshakeRequest,
    ) -> Result<HandshakeResponse, MeshClientError> {
        let mesh = self.lookup(mesh_url)?;
        mesh.handshake
            .handle_handshake(request.clone())
            .await
            .map_err(|e| MeshClientError::Rejected {
                status: handshake_status(&e),
                body: e.to_string(),
            })
    }

    async fn push_credentials(
        &self,
        mesh_url: &str,
        request: &FederationExchangeRequest,
    ) -> Result<FederationExchangeResponse, MeshClientError> {
        let mesh = self.lookup(mesh_url)?;
        mesh.federation
            .receive_credentials(request.clone())
            .await
            .map(|()| FederationExchangeResponse {
                status: "received".to_string(),
            })
            .map_err(|e| MeshClientError::Rejected {
                status: federation_status(&e),
                body: e.to_string(),
            })
    }

    async fn ping(&self, mesh_url: &str) -> Result<PingResponse, MeshClientError> {
        let mesh = self.lookup(mesh_url)?;
        let id = mesh
            .identity
            .get_identity()
            .map_err(|e| MeshClientError::Decode(e.to_string()))?;
        Ok(PingResponse {
            status: "ok".to_string(),
            beacon_id: id.beacon_id,
            fingerprint: id.fingerprint,
            mesh_version: MESH_VERSION.to_string(),
            timestamp: now_timestamp(),
            peer_count: 0,
        })
    }
}

// ── Beacon fixture ───────────────────────────────────────────────────

pub struct Beacon {
    pub mesh: Mesh,
    pub identity: BeaconIdentity,
    pub audit: Arc<MemoryAuditSink>,
    pub idp: Arc<FakeIdp>,
    _dir: tempfile::TempDir,
}

impl Beacon {
    pub fn new(domain: &str, client: Arc<dyn MeshClient>, idp: FakeIdp) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.db");
        let pool = open_database(path.to_str().unwrap(), PoolSettings::default()).unwrap();
        let audit = Arc::new(MemoryAuditSink::new());
        let idp = Arc::new(idp);

        let (mesh, identity) = Mesh::bring_up(MeshDeps {
            pool: pool.clone(),
            settings: Arc::new(SqliteKvStore::new(pool)),
            audit: audit.clone(),
            client,
            idp: idp.clone(),
            domain: domain.to_string(),
            mesh_url: format!("https://{domain}/api/mesh"),
            idp_public_url: format!("https://auth.{domain}"),
            invite_ttl: None,
        })
        .unwrap();

        Self {
            mesh,
            identity,
            audit,
            idp,
            _dir: dir,
        }
    }

    /// Creates a beacon reachable through `loopback`.
    pub fn on(loopback: &Arc<Loopback>, domain: &str) -> Self {
        Self::with_idp(loopback, domain, FakeIdp::default())
    }

    pub fn with_idp(loopback: &Arc<Loopback>, domain: &str, idp: FakeIdp) -> Self {
        let beacon = Self::new(domain, loopback.clone(), idp);
        loopback.register(&beacon.mesh);
        beacon
    }

    pub fn invite_token(&self) -> (beacon_types::Invite, String) {
        let (invite, token) = self
            .mesh
            .invites
            .create_invite(&self.identity, &self.mesh.mesh_url)
            .unwrap();
        (invite, beacon_mesh::encode_invite_token(&token).unwrap())
    }

    pub fn audit_types(&self) -> Vec<&'static str> {
        self.audit.event_types()
    }
}

/// Polls until the peer's federation leaves `PENDING` or is absent for too long.
pub async fn settled_federation(mesh: &Mesh, fingerprint: &str) -> FederationState {
    for _ in 0..200 {
        if let Some(state) = mesh
            .peers
            .get_peer(fingerprint)
            .unwrap()
            .and_then(|p| p.federation)
        {
            if state.status != FederationStatus::Pending {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("federation for {fingerprint} did not settle");
}
