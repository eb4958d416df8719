//! Bidirectional identity-provider trust between peers.
//!
//! For each peer this beacon owns three objects on its identity provider:
//!
//! 1. an **inbound source** that lets users of the peer sign in here,
//! 2. an **outbound provider + application** that lets our users sign in there,
//! 3. and, on the peer's side, the credentials of (2) pushed through
//!    `federation-exchange` so the peer can build its own inbound source.
//!
//! Each step can fail on its own. Progress is written to the peer's
//! federation sub-record as it happens, so a failure leaves the record
//! partially populated with `status = FAILED` and `last_error` set. Nothing
//! is retried automatically; [`FederationConfigurator::retry`] is the
//! operator's manual re-trigger.

use std::sync::Arc;

use async_trait::async_trait;
use beacon_identity::{
    verify_identity_fingerprint, verify_signature, IdentityError, IdentityManager,
    SignatureProvider,
};
use beacon_observe::{record_or_warn_async, AuditSink, EventPayload};
use beacon_types::{
    short_fingerprint, FederationCredentials, FederationExchangeRequest, FederationState,
    FederationStatus, PeerRecord,
};
use thiserror::Error;

use crate::client::{MeshClient, MeshClientError};
use crate::invites::random_token;
use crate::locks::AsyncKeyedLocks;
use crate::peers::{PeerStore, PeerStoreError};

/// Attempts at pushing credentials to a peer that does not know us yet.
const EXCHANGE_SETTLE_ATTEMPTS: u32 = 5;
const EXCHANGE_SETTLE_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum FederationError {
    /// The identity-provider admin API failed.
    #[error("identity provider API error: {0}")]
    Api(String),

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("invalid peer identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid federation signature: {0}")]
    InvalidSignature(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Peers(#[from] PeerStoreError),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Kinds of identity-provider objects the configurator creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Source,
    Provider,
    Application,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Provider => "provider",
            Self::Application => "application",
        }
    }
}

/// An OAuth/OIDC source that trusts a remote identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub name: String,
    pub slug: String,
    pub client_id: String,
    pub client_secret: String,
    pub authorization_url: String,
    pub access_token_url: String,
    pub profile_url: String,
    pub oidc_well_known_url: String,
    pub oidc_jwks_url: String,
}

/// An OAuth2 provider issuing tokens to a remote relying party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// An application binding a provider to a slug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationConfig {
    pub name: String,
    pub slug: String,
    pub provider_id: String,
}

/// Admin capability of the local identity provider.
#[async_trait]
pub trait IdentityProviderAdmin: Send + Sync {
    /// Creates an inbound source and returns its id.
    async fn create_source(&self, config: &SourceConfig) -> Result<String, FederationError>;

    /// Creates an outbound provider and returns its id.
    async fn create_provider(&self, config: &ProviderConfig) -> Result<String, FederationError>;

    /// Creates an application and returns its id.
    async fn create_application(
        &self,
        config: &ApplicationConfig,
    ) -> Result<String, FederationError>;

    /// Deletes an object. Deleting something already gone is not an error.
    async fn delete(&self, kind: ObjectKind, id: &str) -> Result<(), FederationError>;
}

/// Slug used on every beacon for the objects that concern `fingerprint`.
pub fn federation_slug(fingerprint: &str) -> String {
    format!("mesh-{}", short_fingerprint(fingerprint))
}

/// Conventional public URL of a beacon's identity provider.
pub fn peer_idp_url(domain: &str) -> String {
    format!("https://auth.{domain}")
}

/// Message signed by the pusher of federation credentials.
pub fn exchange_message(fingerprint: &str, client_id: &str, issuer: &str) -> String {
    format!("mesh-federation:{fingerprint}:{client_id}:{issuer}")
}

/// OIDC endpoints of one application on an Authentik-style provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcEndpoints {
    pub issuer: String,
    pub authorization_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub jwks_url: String,
    pub well_known_url: String,
}

impl OidcEndpoints {
    pub fn for_application(idp_base: &str, slug: &str) -> Self {
        let base = idp_base.trim_end_matches('/');
        let issuer = format!("{base}/application/o/{slug}/");
        Self {
            authorization_url: format!("{base}/application/o/authorize/"),
            token_url: format!("{base}/application/o/token/"),
            userinfo_url: format!("{base}/application/o/userinfo/"),
            jwks_url: format!("{base}/application/o/{slug}/jwks/"),
            well_known_url: format!("{issuer}.well-known/openid-configuration"),
            issuer,
        }
    }
}

/// Addresses this beacon advertises while federating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationSettings {
    /// Public base URL of our mesh API.
    pub mesh_url: String,
    /// Public base URL of our identity provider.
    pub idp_public_url: String,
}

/// Configures and tears down federation objects for peers.
#[derive(Clone)]
pub struct FederationConfigurator {
    admin: Arc<dyn IdentityProviderAdmin>,
    peers: PeerStore,
    identity: IdentityManager,
    client: Arc<dyn MeshClient>,
    audit: Arc<dyn AuditSink>,
    settings: Arc<FederationSettings>,
    source_locks: Arc<AsyncKeyedLocks>,
}

impl FederationConfigurator {
    pub fn new(
        admin: Arc<dyn IdentityProviderAdmin>,
        peers: PeerStore,
        identity: IdentityManager,
        client: Arc<dyn MeshClient>,
        audit: Arc<dyn AuditSink>,
        settings: FederationSettings,
    ) -> Self {
        Self {
            admin,
            peers,
            identity,
            client,
            audit,
            settings: Arc::new(settings),
            source_locks: Arc::new(AsyncKeyedLocks::new()),
        }
    }

    /// Runs [`configure_peer`](Self::configure_peer) as an independent task.
    ///
    /// The handle resolves to the final federation state; the same state is
    /// observable on the peer record while the task runs.
    pub fn dispatch(
        &self,
        fingerprint: String,
    ) -> tokio::task::JoinHandle<Result<FederationState, FederationError>> {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.configure_peer(&fingerprint).await;
            if let Err(e) = &result {
                tracing::warn!(
                    fingerprint = %short_fingerprint(&fingerprint),
                    "federation configuration aborted: {}",
                    e
                );
            }
            result
        })
    }

    /// Performs the three federation steps for a peer.
    ///
    /// Step failures do not abort the remaining steps that can still run;
    /// they are folded into the returned state.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::UnknownPeer`] if the peer is not stored,
    /// and storage or identity errors that prevent recording progress.
    pub async fn configure_peer(&self, fingerprint: &str) -> Result<FederationState, FederationError> {
        let peer = self.load_peer(fingerprint).await?;
        let own = self.identity.get_identity()?;
        let peer_slug = federation_slug(&peer.fingerprint);
        let our_slug = federation_slug(&own.fingerprint);
        let peer_idp = peer_idp_url(&peer.domain);

        self.update(fingerprint, |f| {
            f.status = FederationStatus::Pending;
            f.last_error = None;
        })
        .await?;
        tracing::info!(fingerprint = %short_fingerprint(fingerprint), "configuring federation");

        let mut errors: Vec<String> = Vec::new();

        // Step 1: inbound source pointing at the peer's application for us.
        // Credentials pushed by the peer create the same slug, so both paths
        // hold the per-peer source lock across the provider call.
        let source_guard = self.source_locks.lock(fingerprint).await;
        let stored_source = self
            .load_peer(fingerprint)
            .await?
            .federation
            .and_then(|f| f.source_id);
        if stored_source.is_some() {
            tracing::debug!(
                fingerprint = %short_fingerprint(fingerprint),
                "inbound source already present, skipping"
            );
        } else {
            let endpoints = OidcEndpoints::for_application(&peer_idp, &our_slug);
            let source = SourceConfig {
                name: format!("Mesh: {}", peer.domain),
                slug: peer_slug.clone(),
                client_id: random_token(),
                client_secret: random_token(),
                authorization_url: endpoints.authorization_url,
                access_token_url: endpoints.token_url,
                profile_url: endpoints.userinfo_url,
                oidc_well_known_url: endpoints.well_known_url,
                oidc_jwks_url: endpoints.jwks_url,
            };
            match self.admin.create_source(&source).await {
                Ok(source_id) => {
                    self.update(fingerprint, move |f| f.source_id = Some(source_id))
                        .await?;
                }
                Err(e) => errors.push(
                    self.step_failed(fingerprint, "inbound_source", e.to_string())
                        .await,
                ),
            }
        }
        drop(source_guard);

        // Step 2: outbound provider and application representing the peer.
        let client_id = random_token();
        let client_secret = random_token();
        let provider = ProviderConfig {
            name: format!("Mesh: {}", peer.domain),
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
            redirect_uri: format!(
                "{}/source/oauth/callback/{our_slug}/",
                peer_idp.trim_end_matches('/')
            ),
        };
        let outbound = match self.admin.create_provider(&provider).await {
            Ok(provider_id) => {
                let id = provider_id.clone();
                let (cid, secret) = (client_id.clone(), client_secret.clone());
                self.update(fingerprint, move |f| {
                    f.provider_id = Some(id);
                    f.client_id = Some(cid);
                    f.client_secret = Some(secret);
                })
                .await?;

                let application = ApplicationConfig {
                    name: format!("Mesh: {}", peer.domain),
                    slug: peer_slug.clone(),
                    provider_id,
                };
                match self.admin.create_application(&application).await {
                    Ok(_) => {
                        let slug = peer_slug.clone();
                        self.update(fingerprint, move |f| f.application_slug = Some(slug))
                            .await?;
                        true
                    }
                    Err(e) => {
                        errors.push(
                            self.step_failed(fingerprint, "outbound_application", e.to_string())
                                .await,
                        );
                        false
                    }
                }
            }
            Err(e) => {
                errors.push(
                    self.step_failed(fingerprint, "outbound_provider", e.to_string())
                        .await,
                );
                false
            }
        };

        // Step 3: hand the outbound credentials to the peer.
        if outbound {
            let endpoints =
                OidcEndpoints::for_application(&self.settings.idp_public_url, &peer_slug);
            let credentials = FederationCredentials {
                client_id: client_id.clone(),
                client_secret,
                issuer: endpoints.issuer.clone(),
                authorization_url: endpoints.authorization_url,
                token_url: endpoints.token_url,
                userinfo_url: endpoints.userinfo_url,
                jwks_url: endpoints.jwks_url,
            };
            let signer = self.identity.signer()?;
            let request = FederationExchangeRequest {
                identity: self.identity.advertised(&self.settings.mesh_url)?,
                signature: Some(signer.sign(
                    exchange_message(&own.fingerprint, &client_id, &endpoints.issuer).as_bytes(),
                )),
                federation_credentials: credentials,
            };
            let mut attempt = 1;
            loop {
                match self.client.push_credentials(&peer.mesh_url, &request).await {
                    Ok(_) => break,
                    // The peer records us only once our handshake response reaches it.
                    Err(MeshClientError::Rejected { status: 404, .. })
                        if attempt < EXCHANGE_SETTLE_ATTEMPTS =>
                    {
                        attempt += 1;
                        tokio::time::sleep(EXCHANGE_SETTLE_DELAY).await;
                    }
                    Err(e) => {
                        errors.push(
                            self.step_failed(fingerprint, "credential_exchange", e.to_string())
                                .await,
                        );
                        break;
                    }
                }
            }
        }

        let final_state = if errors.is_empty() {
            // A failure recorded meanwhile by an incoming exchange stands.
            let state = self
                .update(fingerprint, |f| {
                    if f.status == FederationStatus::Failed {
                        return;
                    }
                    if f.source_id.is_none() {
                        f.status = FederationStatus::Failed;
                        f.last_error = Some("inbound_source: missing".to_string());
                    } else {
                        f.status = FederationStatus::Active;
                        f.last_error = None;
                    }
                })
                .await?;
            if state.status == FederationStatus::Active {
                tracing::info!(fingerprint = %short_fingerprint(fingerprint), "federation active");
                self.audit(
                    fingerprint,
                    EventPayload::FederationConfigured {
                        fingerprint: fingerprint.to_string(),
                    },
                )
                .await;
            } else {
                tracing::warn!(
                    fingerprint = %short_fingerprint(fingerprint),
                    last_error = ?state.last_error,
                    "federation left failed"
                );
            }
            state
        } else {
            let message = errors.join("; ");
            self.update(fingerprint, move |f| {
                let combined = match f.last_error.take() {
                    Some(earlier) if f.status == FederationStatus::Failed => {
                        format!("{message}; {earlier}")
                    }
                    _ => message,
                };
                f.status = FederationStatus::Failed;
                f.last_error = Some(combined);
            })
            .await?
        };
        Ok(final_state)
    }

    /// Removes whatever objects exist for a peer and configures again.
    ///
    /// # Errors
    ///
    /// See [`configure_peer`](Self::configure_peer).
    pub async fn retry(&self, fingerprint: &str) -> Result<FederationState, FederationError> {
        let peer = self.load_peer(fingerprint).await?;
        self.delete_objects(&peer).await;

        let peers = self.peers.clone();
        let fp = fingerprint.to_string();
        tokio::task::spawn_blocking(move || {
            peers.set_federation(&fp, &FederationState::pending(beacon_types::now_timestamp()))
        })
        .await??;

        self.configure_peer(fingerprint).await
    }

    /// Accepts credentials pushed by a peer and (re)creates our inbound source.
    ///
    /// A failure of the identity provider after the request has been
    /// authenticated is not an error of the exchange itself; it is recorded
    /// on the peer's federation sub-record instead.
    ///
    /// # Errors
    ///
    /// - [`FederationError::InvalidIdentity`] if the identity's fingerprint does
    ///   not derive from its key or differs from the stored peer.
    /// - [`FederationError::UnknownPeer`] if the sender is not a peer.
    /// - [`FederationError::InvalidSignature`] if the signature is missing or wrong.
    pub async fn receive_credentials(
        &self,
        request: FederationExchangeRequest,
    ) -> Result<(), FederationError> {
        let fingerprint = request.identity.fingerprint.clone();

        if let Err(e) = verify_identity_fingerprint(&request.identity) {
            let error = FederationError::InvalidIdentity(e.to_string());
            return Err(self.exchange_rejected(&fingerprint, error).await);
        }

        let peer = match self.load_peer(&fingerprint).await {
            Ok(peer) => peer,
            Err(e) => return Err(self.exchange_rejected(&fingerprint, e).await),
        };
        if peer.public_key != request.identity.public_key {
            let error =
                FederationError::InvalidIdentity("public key differs from stored peer".to_string());
            return Err(self.exchange_rejected(&fingerprint, error).await);
        }

        let credentials = &request.federation_credentials;
        let Some(signature) = request.signature.as_deref() else {
            let error = FederationError::InvalidSignature("missing signature".to_string());
            return Err(self.exchange_rejected(&fingerprint, error).await);
        };
        let message = exchange_message(&fingerprint, &credentials.client_id, &credentials.issuer);
        if let Err(e) = verify_signature(&peer.public_key, message.as_bytes(), signature) {
            let error = FederationError::InvalidSignature(e.to_string());
            return Err(self.exchange_rejected(&fingerprint, error).await);
        }

        tracing::info!(
            fingerprint = %short_fingerprint(&fingerprint),
            "received federation credentials"
        );
        self.audit(
            &fingerprint,
            EventPayload::FederationCredentialsReceived {
                fingerprint: fingerprint.clone(),
            },
        )
        .await;

        let _source_guard = self.source_locks.lock(&fingerprint).await;
        let stored_source = self
            .load_peer(&fingerprint)
            .await?
            .federation
            .and_then(|f| f.source_id);
        if let Some(old) = stored_source {
            if let Err(e) = self.admin.delete(ObjectKind::Source, &old).await {
                tracing::warn!(source_id = %old, "failed to delete previous inbound source: {}", e);
            }
        }

        let source = SourceConfig {
            name: format!("Mesh: {}", peer.domain),
            slug: federation_slug(&fingerprint),
            client_id: credentials.client_id.clone(),
            client_secret: credentials.client_secret.clone(),
            authorization_url: credentials.authorization_url.clone(),
            access_token_url: credentials.token_url.clone(),
            profile_url: credentials.userinfo_url.clone(),
            oidc_well_known_url: format!(
                "{}/.well-known/openid-configuration",
                credentials.issuer.trim_end_matches('/')
            ),
            oidc_jwks_url: credentials.jwks_url.clone(),
        };
        match self.admin.create_source(&source).await {
            Ok(source_id) => {
                self.update(&fingerprint, move |f| f.source_id = Some(source_id))
                    .await?;
            }
            Err(e) => {
                let message = self
                    .step_failed(&fingerprint, "inbound_source_exchange", e.to_string())
                    .await;
                self.update(&fingerprint, move |f| {
                    f.source_id = None;
                    f.status = FederationStatus::Failed;
                    f.last_error = Some(message);
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Deletes the peer's federation objects, best effort.
    ///
    /// Returns the number of deletions that failed.
    pub async fn teardown_peer(&self, peer: &PeerRecord) -> usize {
        if peer.federation.is_none() {
            return 0;
        }
        let failures = self.delete_objects(peer).await;
        self.audit(
            &peer.fingerprint,
            EventPayload::FederationTornDown {
                fingerprint: peer.fingerprint.clone(),
                failures,
            },
        )
        .await;
        failures
    }

    async fn delete_objects(&self, peer: &PeerRecord) -> usize {
        let Some(state) = &peer.federation else {
            return 0;
        };
        let targets = [
            (ObjectKind::Application, state.application_slug.as_deref()),
            (ObjectKind::Provider, state.provider_id.as_deref()),
            (ObjectKind::Source, state.source_id.as_deref()),
        ];
        let mut failures = 0;
        for (kind, id) in targets {
            let Some(id) = id else { continue };
            if let Err(e) = self.admin.delete(kind, id).await {
                failures += 1;
                tracing::warn!(
                    fingerprint = %short_fingerprint(&peer.fingerprint),
                    kind = kind.as_str(),
                    id,
                    "failed to delete federation object: {}",
                    e
                );
            }
        }
        failures
    }

    async fn audit(&self, entity_id: &str, payload: EventPayload) {
        record_or_warn_async(Arc::clone(&self.audit), entity_id, payload).await;
    }

    async fn load_peer(&self, fingerprint: &str) -> Result<PeerRecord, FederationError> {
        let peers = self.peers.clone();
        let fp = fingerprint.to_string();
        tokio::task::spawn_blocking(move || peers.get_peer(&fp))
            .await??
            .ok_or_else(|| FederationError::UnknownPeer(fingerprint.to_string()))
    }

    async fn update<F>(&self, fingerprint: &str, update: F) -> Result<FederationState, FederationError>
    where
        F: FnOnce(&mut FederationState) + Send + 'static,
    {
        let peers = self.peers.clone();
        let fp = fingerprint.to_string();
        tokio::task::spawn_blocking(move || peers.update_federation(&fp, update))
            .await??
            .ok_or_else(|| FederationError::UnknownPeer(fingerprint.to_string()))
    }

    async fn step_failed(&self, fingerprint: &str, step: &str, reason: String) -> String {
        tracing::warn!(
            fingerprint = %short_fingerprint(fingerprint),
            step,
            "federation step failed: {}",
            reason
        );
        self.audit(
            fingerprint,
            EventPayload::FederationFailed {
                fingerprint: fingerprint.to_string(),
                step: step.to_string(),
                reason: reason.clone(),
            },
        )
        .await;
        format!("{step}: {reason}")
    }

    async fn exchange_rejected(&self, fingerprint: &str, error: FederationError) -> FederationError {
        tracing::warn!(
            fingerprint = %short_fingerprint(fingerprint),
            "federation exchange rejected: {}",
            error
        );
        self.audit(
            fingerprint,
            EventPayload::FederationExchangeRejected {
                fingerprint: fingerprint.to_string(),
                reason: error.to_string(),
            },
        )
        .await;
        error
    }
}

/// [`IdentityProviderAdmin`] used when no identity provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledIdentityProvider;

const DISABLED: &str = "identity provider admin API is not configured";

#[async_trait]
impl IdentityProviderAdmin for DisabledIdentityProvider {
    async fn create_source(&self, _config: &SourceConfig) -> Result<String, FederationError> {
        Err(FederationError::Api(DISABLED.to_string()))
    }

    async fn create_provider(&self, _config: &ProviderConfig) -> Result<String, FederationError> {
        Err(FederationError::Api(DISABLED.to_string()))
    }

    async fn create_application(
        &self,
        _config: &ApplicationConfig,
    ) -> Result<String, FederationError> {
        Err(FederationError::Api(DISABLED.to_string()))
    }

    async fn delete(&self, _kind: ObjectKind, _id: &str) -> Result<(), FederationError> {
        Err(FederationError::Api(DISABLED.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_uses_short_fingerprint() {
        assert_eq!(
            federation_slug("0123456789abcdef0123456789abcdef"),
            "mesh-0123456789ab"
        );
    }

    #[test]
    fn oidc_endpoints_follow_application_layout() {
        let e = OidcEndpoints::for_application("https://auth.beta.example.org/", "mesh-aaaa");
        assert_eq!(e.issuer, "https://auth.beta.example.org/application/o/mesh-aaaa/");
        assert_eq!(
            e.well_known_url,
            "https://auth.beta.example.org/application/o/mesh-aaaa/.well-known/openid-configuration"
        );
        assert_eq!(
            e.jwks_url,
            "https://auth.beta.example.org/application/o/mesh-aaaa/jwks/"
        );
        assert_eq!(
            e.token_url,
            "https://auth.beta.example.org/application/o/token/"
        );
    }

    #[test]
    fn exchange_message_binds_all_fields() {
        assert_eq!(
            exchange_message("fa", "cid", "https://i/"),
            "mesh-federation:fa:cid:https://i/"
        );
    }

    #[tokio::test]
    async fn disabled_provider_fails_every_call() {
        let idp = DisabledIdentityProvider;
        assert!(matches!(
            idp.delete(ObjectKind::Source, "x").await,
            Err(FederationError::Api(_))
        ));
        let app = ApplicationConfig {
            name: "n".to_string(),
            slug: "s".to_string(),
            provider_id: "1".to_string(),
        };
        assert!(idp.create_application(&app).await.is_err());
    }
}
