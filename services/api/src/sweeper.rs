//! Periodic deletion of sessions idle past the retention window.

use std::{sync::Arc, time::Duration};
use superconnector_core::SessionService;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Runs one sweep every `interval` until `shutdown` is cancelled.
///
/// The first sweep happens one full interval after startup.
pub fn spawn_sweeper(
    sessions: Arc<SessionService>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match sessions.sweep().await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "Swept expired sessions"),
                    Err(e) => error!(error = ?e, "Session sweep failed"),
                },
            }
        }
        info!("Session sweeper stopped.");
    })
}
