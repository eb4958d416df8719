//! Beacon server binary.
//!
//! Loads configuration, brings up the beacon identity and mesh services,
//! optionally registers a reverse-proxy route, starts the peer health loop,
//! and serves the mesh API until SIGTERM/SIGINT. Peer-facing endpoints and
//! operator endpoints are served on separate listeners; only the peer
//! listener sits behind the proxy.

use std::net::SocketAddr;
use std::sync::Arc;

use beacon_server::config::{self, Config};
use beacon_server::proxy::{ensure_mesh_route, CaddyRegistrar};
use beacon_server::{background, build_state, operator_app, peer_app, AppState, StartupError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("BEACON_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Registers the mesh route with Caddy when an admin endpoint is configured.
///
/// A failure here is logged; the beacon still serves on loopback.
async fn register_route(config: &Config, state: &AppState) {
    let Some(admin_url) = &config.proxy.caddy_admin_url else {
        return;
    };
    let registrar =
        match CaddyRegistrar::new(admin_url, &config.proxy.caddy_server, &config.mesh.domain) {
            Ok(registrar) => registrar,
            Err(e) => {
                tracing::warn!("failed to build reverse-proxy client: {}", e);
                return;
            }
        };
    match ensure_mesh_route(
        &registrar,
        Arc::clone(&state.settings),
        &config.proxy.subdomain,
        config.server.port,
    )
    .await
    {
        Ok(route_id) => tracing::info!(route_id = %route_id, "reverse-proxy route in place"),
        Err(e) => tracing::warn!("reverse-proxy registration failed: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("beacon.toml"));

    let config = config::load_config(selected_config_path)?;
    init_tracing(&config);

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let state = build_state(&config)?;
    register_route(&config, &state).await;

    tokio::spawn(background::start_health_task(
        state.mesh.health.clone(),
        config.mesh.health_interval_secs,
    ));

    let peer_addr = SocketAddr::new(config.server.host, config.server.port);
    let operator_addr = SocketAddr::new(config.server.operator_host, config.server.operator_port);
    if !operator_addr.ip().is_loopback() {
        tracing::warn!(%operator_addr, "operator listener is not bound to loopback");
    }
    tracing::info!(
        %peer_addr,
        %operator_addr,
        mesh_url = %state.mesh.mesh_url,
        "starting beacon server"
    );

    let peer_listener = TcpListener::bind(peer_addr).await?;
    let operator_listener = TcpListener::bind(operator_addr).await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let peer = axum::serve(peer_listener, peer_app(state.clone()))
        .with_graceful_shutdown(stopped(stop_rx.clone()));
    let operator = axum::serve(operator_listener, operator_app(state))
        .with_graceful_shutdown(stopped(stop_rx));
    tokio::try_join!(async { peer.await }, async { operator.await })?;

    tracing::info!("beacon server shut down");
    Ok(())
}

/// Resolves once the shutdown flag is raised or its sender is gone.
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
