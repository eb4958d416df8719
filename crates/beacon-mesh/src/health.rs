//! Reachability probing of known peers.
//!
//! A pass probes every peer concurrently. Each probe is bounded by the
//! client's own timeouts, so one silent peer delays the pass by at most its
//! own budget. The monitor only observes: it never removes peers or touches
//! federation.

use std::sync::Arc;

use beacon_observe::{record_or_warn_async, AuditSink, EventPayload};
use beacon_types::{now_timestamp, short_fingerprint, HealthReport, PeerRecord, PeerStatus};
use futures_util::future::join_all;
use thiserror::Error;

use crate::client::MeshClient;
use crate::peers::{PeerStore, PeerStoreError};

#[derive(Debug, Error)]
pub enum HealthError {
    #[error(transparent)]
    Peers(#[from] PeerStoreError),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Periodic peer prober.
#[derive(Clone)]
pub struct HealthMonitor {
    peers: PeerStore,
    client: Arc<dyn MeshClient>,
    audit: Arc<dyn AuditSink>,
}

impl HealthMonitor {
    pub fn new(peers: PeerStore, client: Arc<dyn MeshClient>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            peers,
            client,
            audit,
        }
    }

    /// Probes every peer once and records the results.
    ///
    /// # Errors
    ///
    /// Returns [`HealthError`] only if the peer list cannot be read. Failures
    /// to record an individual result are logged and counted as unhealthy.
    pub async fn run_pass(&self) -> Result<HealthReport, HealthError> {
        let peers = self.peers.clone();
        let list = tokio::task::spawn_blocking(move || peers.list_peers()).await??;

        let results = join_all(list.iter().map(|peer| self.probe(peer))).await;

        let total = results.len();
        let healthy = results.iter().filter(|ok| **ok).count();
        let report = HealthReport {
            total,
            healthy,
            unhealthy: total - healthy,
            checked_at: now_timestamp(),
        };
        tracing::info!(
            total = report.total,
            healthy = report.healthy,
            unhealthy = report.unhealthy,
            "health check pass complete"
        );
        Ok(report)
    }

    /// Probes one peer, stores the outcome, and returns whether it answered.
    async fn probe(&self, peer: &PeerRecord) -> bool {
        let (reachable, detail) = match self.client.ping(&peer.mesh_url).await {
            Ok(pong) if pong.fingerprint == peer.fingerprint => (true, "ok".to_string()),
            Ok(pong) => (
                false,
                format!(
                    "fingerprint mismatch: peer answered as {}",
                    short_fingerprint(&pong.fingerprint)
                ),
            ),
            Err(e) => (false, e.to_string()),
        };

        let peers = self.peers.clone();
        let fp = peer.fingerprint.clone();
        let stored_detail = detail.clone();
        let previous = match tokio::task::spawn_blocking(move || {
            peers.record_check(&fp, reachable, &stored_detail)
        })
        .await
        {
            Ok(Ok(previous)) => previous,
            Ok(Err(e)) => {
                tracing::error!(
                    fingerprint = %short_fingerprint(&peer.fingerprint),
                    "failed to record health check: {}",
                    e
                );
                return false;
            }
            Err(e) => {
                tracing::error!("health check join error: {}", e);
                return false;
            }
        };

        match (previous, reachable) {
            (Some(PeerStatus::Active), false) => {
                tracing::warn!(
                    fingerprint = %short_fingerprint(&peer.fingerprint),
                    domain = %peer.domain,
                    detail = %detail,
                    "peer became unreachable"
                );
                self.audit(
                    &peer.fingerprint,
                    EventPayload::PeerUnreachable {
                        fingerprint: peer.fingerprint.clone(),
                        detail,
                    },
                )
                .await;
            }
            (Some(PeerStatus::Unreachable), true) => {
                tracing::info!(
                    fingerprint = %short_fingerprint(&peer.fingerprint),
                    domain = %peer.domain,
                    "peer recovered"
                );
                self.audit(
                    &peer.fingerprint,
                    EventPayload::PeerRecovered {
                        fingerprint: peer.fingerprint.clone(),
                    },
                )
                .await;
            }
            _ => {}
        }
        reachable
    }

    async fn audit(&self, entity_id: &str, payload: EventPayload) {
        record_or_warn_async(Arc::clone(&self.audit), entity_id, payload).await;
    }
}
