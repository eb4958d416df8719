//! HTTP transport from this beacon to its peers.
//!
//! Every call is bounded by a connect timeout and a total timeout so that a
//! silent peer costs at most its own budget.

use std::time::Duration;

use async_trait::async_trait;
use beacon_types::{
    FederationExchangeRequest, FederationExchangeResponse, HandshakeRequest, HandshakeResponse,
    PingResponse,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshClientError {
    /// The peer answered with a non-success status.
    #[error("peer rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The peer could not be reached or did not answer in time.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The peer answered with a body we could not understand.
    #[error("malformed peer response: {0}")]
    Decode(String),
}

/// Calls a peer's mesh API.
#[async_trait]
pub trait MeshClient: Send + Sync {
    /// `POST {mesh_url}/handshake`.
    async fn handshake(
        &self,
        mesh_url: &str,
        request: &HandshakeRequest,
    ) -> Result<HandshakeResponse, MeshClientError>;

    /// `POST {mesh_url}/federation-exchange`.
    async fn push_credentials(
        &self,
        mesh_url: &str,
        request: &FederationExchangeRequest,
    ) -> Result<FederationExchangeResponse, MeshClientError>;

    /// `GET {mesh_url}/ping`.
    async fn ping(&self, mesh_url: &str) -> Result<PingResponse, MeshClientError>;
}

/// Connect and total budgets for each kind of outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeouts {
    pub handshake_connect: Duration,
    pub handshake_total: Duration,
    pub probe_connect: Duration,
    pub probe_total: Duration,
    pub exchange_total: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            handshake_connect: Duration::from_secs(10),
            handshake_total: Duration::from_secs(30),
            probe_connect: Duration::from_secs(5),
            probe_total: Duration::from_secs(10),
            exchange_total: Duration::from_secs(30),
        }
    }
}

/// [`MeshClient`] over `reqwest`, one pooled client per timeout profile.
#[derive(Clone)]
pub struct HttpMeshClient {
    handshake: reqwest::Client,
    probe: reqwest::Client,
    exchange: reqwest::Client,
}

impl HttpMeshClient {
    pub fn new(timeouts: ClientTimeouts) -> Result<Self, MeshClientError> {
        let build = |connect: Duration, total: Duration| {
            reqwest::Client::builder()
                .connect_timeout(connect)
                .timeout(total)
                .user_agent(concat!("beacon-mesh/", env!("CARGO_PKG_VERSION")))
                .build()
        };
        Ok(Self {
            handshake: build(timeouts.handshake_connect, timeouts.handshake_total)?,
            probe: build(timeouts.probe_connect, timeouts.probe_total)?,
            exchange: build(timeouts.handshake_connect, timeouts.exchange_total)?,
        })
    }
}

fn endpoint(mesh_url: &str, path: &str) -> String {
    format!("{}/{path}", mesh_url.trim_end_matches('/'))
}

async fn decode<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, MeshClientError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(MeshClientError::Rejected {
            status: status.as_u16(),
            body,
        });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| MeshClientError::Decode(e.to_string()))
}

#[async_trait]
impl MeshClient for HttpMeshClient {
    async fn handshake(
        &self,
        mesh_url: &str,
        request: &HandshakeRequest,
    ) -> Result<HandshakeResponse, MeshClientError> {
        let resp = self
            .handshake
            .post(endpoint(mesh_url, "handshake"))
            .json(request)
            .send()
            .await?;
        decode(resp).await
    }

    async fn push_credentials(
        &self,
        mesh_url: &str,
        request: &FederationExchangeRequest,
    ) -> Result<FederationExchangeResponse, MeshClientError> {
        let resp = self
            .exchange
            .post(endpoint(mesh_url, "federation-exchange"))
            .json(request)
            .send()
            .await?;
        decode(resp).await
    }

    async fn ping(&self, mesh_url: &str) -> Result<PingResponse, MeshClientError> {
        let resp = self.probe.get(endpoint(mesh_url, "ping")).send().await?;
        decode(resp).await
    }
}
