//! Reverse-proxy route registration.
//!
//! The server binds to loopback; a reverse proxy in front of it makes the
//! peer-facing half of the mesh API reachable from other beacons. Only the
//! paths in [`PEER_PATHS`] are proxied, and only the peer listener is the
//! upstream. When a Caddy admin endpoint is configured the server registers
//! its own route at bring-up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_db::{KeyValueStore, KvError};
use serde_json::json;
use thiserror::Error;

/// Key under which the registered route id is remembered.
pub const ROUTE_ID_SETTING: &str = "proxy.mesh_route_id";

/// Paths other beacons call. Everything else stays on the operator listener.
pub const PEER_PATHS: [&str; 4] = [
    "/api/mesh/handshake",
    "/api/mesh/federation-exchange",
    "/api/mesh/ping",
    "/api/mesh/identity",
];

/// Public host routed to this beacon.
pub fn mesh_host(subdomain: &str, domain: &str) -> String {
    format!("{subdomain}.{domain}")
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy admin request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("proxy admin rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error(transparent)]
    Store(#[from] KvError),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Adds and removes routes on a reverse proxy.
#[async_trait]
pub trait ReverseProxyRegistrar: Send + Sync {
    /// Routes `<subdomain>.<domain>` to the local `port`; returns the route id.
    async fn add_route(&self, subdomain: &str, port: u16) -> Result<String, ProxyError>;

    async fn remove_route(&self, route_id: &str) -> Result<(), ProxyError>;
}

/// [`ReverseProxyRegistrar`] backed by the Caddy admin API.
#[derive(Clone)]
pub struct CaddyRegistrar {
    client: reqwest::Client,
    admin_url: String,
    server: String,
    domain: String,
}

impl CaddyRegistrar {
    pub fn new(admin_url: &str, server: &str, domain: &str) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            admin_url: admin_url.trim_end_matches('/').to_string(),
            server: server.to_string(),
            domain: domain.to_string(),
        })
    }

    async fn check(resp: reqwest::Response) -> Result<(), ProxyError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(ProxyError::Rejected {
            status: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        })
    }
}

/// The Caddy route object proxying [`PEER_PATHS`] on `host` to `127.0.0.1:port`.
pub fn caddy_route(route_id: &str, host: &str, port: u16) -> serde_json::Value {
    json!({
        "@id": route_id,
        "match": [{ "host": [host], "path": PEER_PATHS }],
        "handle": [{
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": format!("127.0.0.1:{port}") }]
        }],
        "terminal": true
    })
}

#[async_trait]
impl ReverseProxyRegistrar for CaddyRegistrar {
    async fn add_route(&self, subdomain: &str, port: u16) -> Result<String, ProxyError> {
        let host = mesh_host(subdomain, &self.domain);
        let route_id = format!("beacon-{}", host.replace('.', "-"));
        let resp = self
            .client
            .post(format!(
                "{}/config/apps/http/servers/{}/routes",
                self.admin_url, self.server
            ))
            .json(&caddy_route(&route_id, &host, port))
            .send()
            .await?;
        Self::check(resp).await?;
        tracing::info!(route_id = %route_id, host = %host, port, "registered reverse-proxy route");
        Ok(route_id)
    }

    async fn remove_route(&self, route_id: &str) -> Result<(), ProxyError> {
        let resp = self
            .client
            .delete(format!("{}/id/{route_id}", self.admin_url))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(resp).await
    }
}

/// Registers the mesh route once and remembers its id.
///
/// Returns the id of the route, whether it was created now or earlier.
pub async fn ensure_mesh_route(
    registrar: &dyn ReverseProxyRegistrar,
    settings: Arc<dyn KeyValueStore>,
    subdomain: &str,
    port: u16,
) -> Result<String, ProxyError> {
    let store = settings.clone();
    let existing = tokio::task::spawn_blocking(move || store.get(ROUTE_ID_SETTING)).await??;
    if let Some(route_id) = existing {
        tracing::debug!(route_id = %route_id, "reverse-proxy route already registered");
        return Ok(route_id);
    }

    let route_id = registrar.add_route(subdomain, port).await?;
    let stored = route_id.clone();
    tokio::task::spawn_blocking(move || settings.set(ROUTE_ID_SETTING, &stored)).await??;
    Ok(route_id)
}
