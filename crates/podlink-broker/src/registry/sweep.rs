//! Background expiry sweep

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::SessionRegistry;

/// Periodically end expired sessions until `shutdown` fires
pub fn spawn_sweeper(
    registry: SessionRegistry,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Session sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let swept = registry.sweep_expired().await;
                    if swept > 0 {
                        info!(swept, remaining = registry.len(), "Swept expired sessions");
                    }
                }
            }
        }
    })
}
