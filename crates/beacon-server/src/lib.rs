//! Beacon server library logic.

pub mod api;
pub mod background;
pub mod config;
pub mod proxy;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    routing::{get, post},
    Extension, Json, Router,
};
use beacon_db::{open_database, DbPool, KeyValueStore, PoolError, SqliteKvStore};
use beacon_identity::IdentityError;
use beacon_mesh::{
    AuthentikAdmin, DisabledIdentityProvider, FederationError, HttpMeshClient,
    IdentityProviderAdmin, Mesh, MeshClientError, MeshDeps,
};
use beacon_observe::{AuditSink, SqliteAuditSink};
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// The assembled mesh services.
    pub mesh: Mesh,
    /// Durable settings (identity material, proxy route id).
    pub settings: Arc<dyn KeyValueStore>,
}

/// Errors that stop the server from coming up.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Database(#[from] PoolError),

    #[error("identity bring-up failed: {0}")]
    Identity(#[from] IdentityError),

    #[error("failed to build mesh client: {0}")]
    Client(#[from] MeshClientError),

    #[error("failed to build identity provider client: {0}")]
    IdentityProvider(#[from] FederationError),

    #[error("failed to bind listener: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens the database and brings up the mesh services described by `config`.
///
/// # Errors
///
/// Returns [`StartupError`] if the database, identity or clients cannot be set up.
pub fn build_state(config: &Config) -> Result<AppState, StartupError> {
    let pool = open_database(&config.database.path, config.database.pool_settings())?;
    let settings: Arc<dyn KeyValueStore> = Arc::new(SqliteKvStore::new(pool.clone()));
    let audit: Arc<dyn AuditSink> = Arc::new(SqliteAuditSink::new(pool.clone()));
    let client = Arc::new(HttpMeshClient::new(config.mesh.client_timeouts())?);

    let idp: Arc<dyn IdentityProviderAdmin> = match (&config.idp.base_url, &config.idp.api_token) {
        (Some(base_url), Some(token)) => Arc::new(AuthentikAdmin::new(
            base_url,
            token,
            config.idp.authorization_flow.clone(),
            Duration::from_secs(config.mesh.exchange_timeout_secs),
        )?),
        (Some(base_url), None) => {
            tracing::warn!(base_url = %base_url, "idp.api_token missing, federation disabled");
            Arc::new(DisabledIdentityProvider)
        }
        _ => {
            tracing::info!("no identity provider configured, federation disabled");
            Arc::new(DisabledIdentityProvider)
        }
    };

    let (mesh, _identity) = Mesh::bring_up(MeshDeps {
        pool: pool.clone(),
        settings: settings.clone(),
        audit,
        client,
        idp,
        domain: config.mesh.domain.clone(),
        mesh_url: config.mesh_url(),
        idp_public_url: config.idp.public_url(&config.mesh.domain),
        invite_ttl: config.mesh.invite_ttl(),
    })?;

    Ok(AppState {
        pool,
        mesh,
        settings,
    })
}

/// Maximum request body size (64 KiB). Mesh payloads are small JSON documents.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Liveness handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Router for the listener the reverse proxy forwards to.
///
/// Holds only what other beacons call; the Caddy route matches the same
/// [`proxy::PEER_PATHS`]. Cross-origin reads of the public identity are
/// allowed, nothing else.
pub fn peer_app(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/api/mesh/identity", get(api::identity_handler))
        .route("/api/mesh/ping", get(api::ping_handler))
        .route("/api/mesh/handshake", post(api::handshake_handler))
        .route(
            "/api/mesh/federation-exchange",
            post(api::federation_exchange_handler),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET]),
        );
    with_common_layers(router, state)
}

/// Router for the operator listener, which never leaves loopback.
pub fn operator_app(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/api/mesh/identity", get(api::identity_handler))
        .route("/api/mesh/peers", get(api::list_peers_handler))
        .route("/api/mesh/health", get(api::health_handler))
        .route("/api/mesh/create-invite", post(api::create_invite_handler))
        .route("/api/mesh/accept-invite", post(api::accept_invite_handler))
        .route("/api/mesh/invites", get(api::list_invites_handler))
        .route(
            "/api/mesh/handshakes/{job_id}",
            get(api::get_handshake_handler),
        )
        .route(
            "/api/mesh/peers/{fingerprint}",
            axum::routing::delete(api::remove_peer_handler),
        )
        .route(
            "/api/mesh/peers/{fingerprint}/federation",
            post(api::retry_federation_handler),
        )
        .route("/api/mesh/events", get(api::get_events_handler));
    with_common_layers(router, state)
}

fn with_common_layers(router: Router, state: AppState) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
