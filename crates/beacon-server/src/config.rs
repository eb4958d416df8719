//! Server configuration loading from file and environment variables.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use beacon_db::PoolSettings;
use beacon_mesh::ClientTimeouts;
use serde::Deserialize;
use thiserror::Error;

use crate::proxy::mesh_host;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub mesh: MeshConfig,

    /// Identity-provider admin API. Federation is disabled without `base_url`.
    #[serde(default)]
    pub idp: IdpConfig,

    /// Reverse-proxy registration. Skipped without `caddy_admin_url`.
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Network configuration for the HTTP listeners.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address of the peer listener. Public reachability is the proxy's job.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port of the peer listener, the reverse proxy's upstream.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host address of the operator listener.
    #[serde(default = "default_host")]
    pub operator_host: IpAddr,

    /// Port of the operator listener. Never registered with the proxy.
    #[serde(default = "default_operator_port")]
    pub operator_port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "beacon_mesh=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Mesh settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MeshConfig {
    /// Public hostname of this beacon.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Public base URL of the mesh API.
    /// Defaults to `https://<proxy.subdomain>.<domain>/api/mesh`.
    #[serde(default)]
    pub public_url: Option<String>,

    /// Seconds between background health passes. `0` disables the loop.
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    /// Invite lifetime. Unset means invites never expire.
    #[serde(default)]
    pub invite_ttl_secs: Option<u64>,

    #[serde(default = "default_handshake_connect_timeout_secs")]
    pub handshake_connect_timeout_secs: u64,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_probe_connect_timeout_secs")]
    pub probe_connect_timeout_secs: u64,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_exchange_timeout_secs")]
    pub exchange_timeout_secs: u64,
}

/// Identity-provider admin API settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdpConfig {
    /// Base URL of the admin API.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub api_token: Option<String>,

    /// Public URL of the identity provider. Defaults to `https://auth.<domain>`.
    #[serde(default)]
    pub public_url: Option<String>,

    /// Authorization flow slug attached to outbound providers.
    #[serde(default)]
    pub authorization_flow: Option<String>,
}

/// Reverse-proxy settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Caddy admin endpoint, e.g. `http://127.0.0.1:2019`.
    #[serde(default)]
    pub caddy_admin_url: Option<String>,

    /// Caddy HTTP server the route is added to.
    #[serde(default = "default_caddy_server")]
    pub caddy_server: String,

    /// Subdomain routed to this beacon.
    #[serde(default = "default_subdomain")]
    pub subdomain: String,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8740
}

fn default_db_path() -> String {
    "beacon.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_health_interval_secs() -> u64 {
    3_600
}

fn default_handshake_connect_timeout_secs() -> u64 {
    10
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_probe_connect_timeout_secs() -> u64 {
    5
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_exchange_timeout_secs() -> u64 {
    30
}

fn default_operator_port() -> u16 {
    8741
}

fn default_caddy_server() -> String {
    "srv0".to_string()
}

fn default_subdomain() -> String {
    "mesh".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            operator_host: default_host(),
            operator_port: default_operator_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl DatabaseConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            public_url: None,
            health_interval_secs: default_health_interval_secs(),
            invite_ttl_secs: None,
            handshake_connect_timeout_secs: default_handshake_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            probe_connect_timeout_secs: default_probe_connect_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            exchange_timeout_secs: default_exchange_timeout_secs(),
        }
    }
}

impl Config {
    /// The mesh API URL advertised to peers.
    ///
    /// Without an explicit `mesh.public_url` this is the host the proxy
    /// route is registered for.
    pub fn mesh_url(&self) -> String {
        match &self.mesh.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!(
                "https://{}/api/mesh",
                mesh_host(&self.proxy.subdomain, &self.mesh.domain)
            ),
        }
    }
}

impl MeshConfig {
    pub fn invite_ttl(&self) -> Option<Duration> {
        self.invite_ttl_secs.map(Duration::from_secs)
    }

    pub fn client_timeouts(&self) -> ClientTimeouts {
        ClientTimeouts {
            handshake_connect: Duration::from_secs(self.handshake_connect_timeout_secs),
            handshake_total: Duration::from_secs(self.handshake_timeout_secs),
            probe_connect: Duration::from_secs(self.probe_connect_timeout_secs),
            probe_total: Duration::from_secs(self.probe_timeout_secs),
            exchange_total: Duration::from_secs(self.exchange_timeout_secs),
        }
    }
}

impl IdpConfig {
    /// The public identity-provider URL for `domain`.
    pub fn public_url(&self, domain: &str) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => beacon_mesh::federation::peer_idp_url(domain),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            caddy_admin_url: None,
            caddy_server: default_caddy_server(),
            subdomain: default_subdomain(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `BEACON_HOST` overrides `server.host`
/// - `BEACON_PORT` overrides `server.port`
/// - `BEACON_OPERATOR_PORT` overrides `server.operator_port`
/// - `BEACON_DB_PATH` overrides `database.path`
/// - `BEACON_LOG_LEVEL` overrides `logging.level`
/// - `BEACON_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `BEACON_DOMAIN` overrides `mesh.domain`
/// - `BEACON_PUBLIC_URL` overrides `mesh.public_url`
/// - `BEACON_IDP_URL` overrides `idp.base_url`
/// - `BEACON_IDP_TOKEN` overrides `idp.api_token`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `BEACON_*` overrides looked up through `var`.
pub fn apply_overrides<F>(config: &mut Config, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = var("BEACON_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("BEACON_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(port) = var("BEACON_OPERATOR_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.operator_port = parsed;
        }
    }
    if let Some(db_path) = var("BEACON_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("BEACON_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("BEACON_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(domain) = var("BEACON_DOMAIN") {
        config.mesh.domain = domain;
    }
    if let Some(url) = var("BEACON_PUBLIC_URL") {
        config.mesh.public_url = Some(url);
    }
    if let Some(url) = var("BEACON_IDP_URL") {
        config.idp.base_url = Some(url);
    }
    if let Some(token) = var("BEACON_IDP_TOKEN") {
        config.idp.api_token = Some(token);
    }
}
