//! Background tasks for the beacon server.
//!
//! Includes:
//! - Periodic peer health passes.

use beacon_mesh::HealthMonitor;
use tokio::time::{sleep, Duration};

/// Starts the peer health loop.
///
/// Runs one pass every `interval_seconds` until the runtime shuts down. A
/// failed pass is logged and the loop carries on.
pub async fn start_health_task(monitor: HealthMonitor, interval_seconds: u64) {
    if interval_seconds == 0 {
        tracing::warn!("health task disabled (interval=0)");
        return;
    }

    let interval = Duration::from_secs(interval_seconds);
    tracing::info!(interval_seconds, "starting peer health task");

    loop {
        sleep(interval).await;

        match monitor.run_pass().await {
            Ok(report) => {
                if report.unhealthy > 0 {
                    tracing::warn!(
                        unhealthy = report.unhealthy,
                        total = report.total,
                        "some peers are unreachable"
                    );
                }
            }
            Err(e) => {
                tracing::error!("health pass failed: {}", e);
            }
        }
    }
}
