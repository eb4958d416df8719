//! Mesh API handlers.
//!
//! Every handler maps its service errors onto [`ApiError`], which renders as
//! `{"error": "<message>"}` with the matching status code.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use beacon_identity::IdentityError;
use beacon_mesh::{
    FederationError, HandshakeError, HealthError, InviteError, PeerStoreError, TokenError,
};
use beacon_observe::{query_events, AuditEvent, EventDomain, EventFilter};
use beacon_types::{
    BeaconIdentity, FederationExchangeRequest, FederationExchangeResponse, HandshakeJob,
    HandshakeRequest, HandshakeResponse, HealthReport, InviteSummary, PingResponse,
    SanitizedPeer, MESH_VERSION,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::AppState;

/// Error type for mesh API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("identity provider error: {0}")]
    BadGateway(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<InviteError> for ApiError {
    fn from(e: InviteError) -> Self {
        match e {
            InviteError::NotFound => ApiError::NotFound(e.to_string()),
            InviteError::AlreadyUsed | InviteError::SecretMismatch | InviteError::Expired => {
                ApiError::Forbidden(e.to_string())
            }
            _ => ApiError::InternalServerError(e.to_string()),
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::NotConfigured => ApiError::ServiceUnavailable(e.to_string()),
            _ => ApiError::InternalServerError(e.to_string()),
        }
    }
}

impl From<PeerStoreError> for ApiError {
    fn from(e: PeerStoreError) -> Self {
        match e {
            PeerStoreError::NotFound(_) => ApiError::NotFound(e.to_string()),
            _ => ApiError::InternalServerError(e.to_string()),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<HandshakeError> for ApiError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::Token(e) => e.into(),
            HandshakeError::Invite(e) => e.into(),
            HandshakeError::Peers(e) => e.into(),
            HandshakeError::NotConfigured => ApiError::ServiceUnavailable(e.to_string()),
            HandshakeError::InvalidPeerIdentity(_) | HandshakeError::SelfPeering => {
                ApiError::BadRequest(e.to_string())
            }
            HandshakeError::JobNotFound(_) => ApiError::NotFound(e.to_string()),
            _ => ApiError::InternalServerError(e.to_string()),
        }
    }
}

impl From<FederationError> for ApiError {
    fn from(e: FederationError) -> Self {
        match e {
            FederationError::UnknownPeer(_) => ApiError::NotFound(e.to_string()),
            FederationError::InvalidIdentity(_) | FederationError::InvalidSignature(_) => {
                ApiError::BadRequest(e.to_string())
            }
            FederationError::Api(_) => ApiError::BadGateway(e.to_string()),
            FederationError::Identity(e) => e.into(),
            FederationError::Peers(e) => e.into(),
            _ => ApiError::InternalServerError(e.to_string()),
        }
    }
}

impl From<HealthError> for ApiError {
    fn from(e: HealthError) -> Self {
        match e {
            HealthError::Peers(e) => e.into(),
            _ => ApiError::InternalServerError(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::InternalServerError(format!("task join error: {e}"))
    }
}

/// Response for `POST /api/mesh/create-invite`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateInviteResponse {
    pub invite_id: String,
    /// Transport-encoded invite token to hand to the other operator.
    pub token: String,
    pub created_at: String,
}

/// Request body for `POST /api/mesh/accept-invite`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptInviteRequest {
    pub token: String,
}

/// Response for asynchronous operations.
#[derive(Debug, Serialize, Deserialize)]
pub struct InProgressResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl InProgressResponse {
    fn new(job_id: Option<String>) -> Self {
        Self {
            status: "in_progress".to_string(),
            job_id,
        }
    }
}

/// Response for `GET /api/mesh/health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub beacon_id: String,
    pub domain: String,
    pub fingerprint: String,
    pub peer_count: usize,
    #[serde(flatten)]
    pub report: HealthReport,
}

/// Response for `DELETE /api/mesh/peers/{fingerprint}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RemovePeerResponse {
    pub status: String,
    pub fingerprint: String,
    /// Identity-provider objects that could not be deleted.
    pub teardown_failures: usize,
}

/// Query parameters for `GET /api/mesh/events`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Filter by event domain (e.g., `INVITE`, `HANDSHAKE`).
    pub domain: Option<String>,
    /// Filter by event type (e.g., `SPOOF_DETECTED`).
    pub event_type: Option<String>,
    /// Filter by entity ID (fingerprint or invite ID).
    pub entity_id: Option<String>,
    /// Return events with a sequence number greater than this.
    pub after_seq: Option<i64>,
    /// Maximum number of events to return (default: 100, max: 1000).
    pub limit: Option<i64>,
}

/// Response wrapper for event retrieval.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub events: Vec<AuditEvent>,
    pub count: usize,
}

/// Handler for `GET /api/mesh/identity`.
pub async fn identity_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<BeaconIdentity>, ApiError> {
    let identity = state.mesh.identity.clone();
    let mesh_url = state.mesh.mesh_url.clone();
    let advertised = tokio::task::spawn_blocking(move || identity.advertised(&mesh_url)).await??;
    Ok(Json(advertised))
}

/// Handler for `GET /api/mesh/peers`. Never exposes secrets or key material.
pub async fn list_peers_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<SanitizedPeer>>, ApiError> {
    let peers = state.mesh.peers.clone();
    let list = tokio::task::spawn_blocking(move || peers.list_peers_sanitized()).await??;
    Ok(Json(list))
}

/// Handler for `GET /api/mesh/ping`.
pub async fn ping_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<PingResponse>, ApiError> {
    let mesh = state.mesh.clone();
    let (identity, peer_count) = tokio::task::spawn_blocking(move || {
        let identity = mesh.identity.get_identity()?;
        let count = mesh.peers.count()?;
        Ok::<_, ApiError>((identity, count))
    })
    .await??;

    Ok(Json(PingResponse {
        status: "ok".to_string(),
        beacon_id: identity.beacon_id,
        fingerprint: identity.fingerprint,
        mesh_version: MESH_VERSION.to_string(),
        timestamp: beacon_types::now_timestamp(),
        peer_count,
    }))
}

/// Handler for `GET /api/mesh/health`. Runs a probe pass on demand.
pub async fn health_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<HealthResponse>, ApiError> {
    let report = state.mesh.health.run_pass().await?;

    let mesh = state.mesh.clone();
    let (identity, peer_count) = tokio::task::spawn_blocking(move || {
        let identity = mesh.identity.get_identity()?;
        let count = mesh.peers.count()?;
        Ok::<_, ApiError>((identity, count))
    })
    .await??;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        beacon_id: identity.beacon_id,
        domain: identity.domain,
        fingerprint: identity.fingerprint,
        peer_count,
        report,
    }))
}

/// Handler for `POST /api/mesh/handshake`, called by a beacon redeeming one of our invites.
pub async fn handshake_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<HandshakeRequest>,
) -> Result<Json<HandshakeResponse>, ApiError> {
    let response = state.mesh.handshake.handle_handshake(payload).await?;
    Ok(Json(response))
}

/// Handler for `POST /api/mesh/federation-exchange`.
pub async fn federation_exchange_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<FederationExchangeRequest>,
) -> Result<Json<FederationExchangeResponse>, ApiError> {
    state.mesh.federation.receive_credentials(payload).await?;
    Ok(Json(FederationExchangeResponse {
        status: "received".to_string(),
    }))
}

/// Handler for `POST /api/mesh/create-invite`.
pub async fn create_invite_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<CreateInviteResponse>, ApiError> {
    let mesh = state.mesh.clone();
    let (invite, token) = tokio::task::spawn_blocking(move || {
        let identity = mesh.identity.get_identity()?;
        let created = mesh.invites.create_invite(&identity, &mesh.mesh_url)?;
        Ok::<_, ApiError>(created)
    })
    .await??;

    let token = beacon_mesh::encode_invite_token(&token)?;
    Ok(Json(CreateInviteResponse {
        invite_id: invite.invite_id,
        token,
        created_at: invite.created_at,
    }))
}

/// Handler for `POST /api/mesh/accept-invite`.
///
/// The token is checked before responding; the handshake itself runs as a
/// background job observable at `GET /api/mesh/handshakes/{job_id}`.
pub async fn accept_invite_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<AcceptInviteRequest>,
) -> Result<(StatusCode, Json<InProgressResponse>), ApiError> {
    let job = state.mesh.handshake.accept_invite(&payload.token).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(InProgressResponse::new(Some(job.job_id))),
    ))
}

/// Handler for `GET /api/mesh/invites`.
pub async fn list_invites_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<InviteSummary>>, ApiError> {
    let invites = state.mesh.invites.clone();
    let list = tokio::task::spawn_blocking(move || invites.list_invites()).await??;
    Ok(Json(list))
}

/// Handler for `GET /api/mesh/handshakes/{job_id}`.
pub async fn get_handshake_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<HandshakeJob>, ApiError> {
    let job = state.mesh.handshake.get_job(&job_id).await?;
    Ok(Json(job))
}

/// Handler for `DELETE /api/mesh/peers/{fingerprint}`.
///
/// Tears down federation objects first (best effort), then drops the record.
pub async fn remove_peer_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> Result<Json<RemovePeerResponse>, ApiError> {
    let peers = state.mesh.peers.clone();
    let fp = fingerprint.clone();
    let peer = tokio::task::spawn_blocking(move || peers.get_peer(&fp))
        .await??
        .ok_or_else(|| ApiError::NotFound(format!("peer not found: {fingerprint}")))?;

    let teardown_failures = state.mesh.federation.teardown_peer(&peer).await;

    let peers = state.mesh.peers.clone();
    let fp = fingerprint.clone();
    tokio::task::spawn_blocking(move || peers.remove_peer(&fp)).await??;

    Ok(Json(RemovePeerResponse {
        status: "removed".to_string(),
        fingerprint,
        teardown_failures,
    }))
}

/// Handler for `POST /api/mesh/peers/{fingerprint}/federation`.
///
/// Re-runs federation configuration for a known peer in the background.
pub async fn retry_federation_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> Result<(StatusCode, Json<InProgressResponse>), ApiError> {
    let peers = state.mesh.peers.clone();
    let fp = fingerprint.clone();
    if tokio::task::spawn_blocking(move || peers.get_peer(&fp))
        .await??
        .is_none()
    {
        return Err(ApiError::NotFound(format!("peer not found: {fingerprint}")));
    }

    let federation = state.mesh.federation.clone();
    tokio::spawn(async move {
        match federation.retry(&fingerprint).await {
            Ok(outcome) => tracing::info!(
                fingerprint = %beacon_types::short_fingerprint(&fingerprint),
                status = ?outcome.status,
                "federation retry finished"
            ),
            Err(e) => tracing::warn!(
                fingerprint = %beacon_types::short_fingerprint(&fingerprint),
                "federation retry aborted: {}",
                e
            ),
        }
    });

    Ok((StatusCode::ACCEPTED, Json(InProgressResponse::new(None))))
}

/// Handler for `GET /api/mesh/events`.
pub async fn get_events_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let domain = match &params.domain {
        Some(d) => Some(d.parse::<EventDomain>().map_err(|_| {
            ApiError::BadRequest(format!(
                "invalid domain: {d}. Expected one of: INVITE, PEER, HANDSHAKE, FEDERATION, HEALTH"
            ))
        })?),
        None => None,
    };

    let filter = EventFilter {
        domain,
        event_type: params.event_type,
        entity_id: params.entity_id,
        min_severity: None,
        after_seq: params.after_seq,
        limit: Some(params.limit.unwrap_or(100).clamp(1, 1000)),
    };

    let pool = state.pool.clone();
    let events = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {e}")))?;
        query_events(&conn, &filter).map_err(|e| ApiError::InternalServerError(e.to_string()))
    })
    .await??;

    let count = events.len();
    Ok(Json(EventsResponse { events, count }))
}
