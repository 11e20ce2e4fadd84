//! Background loops: periodic alert evaluation and stale-session reaping.
//!
//! Cancellation is checked only between ticks, so a tick that has started
//! always runs to completion.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::alerts::AlertEngine;
use crate::pipeline::SessionManager;

// ---

/// Run [`AlertEngine::evaluate_all_sites`] every `interval` until `shutdown`
/// is cancelled.
pub async fn evaluation_loop(
    engine: Arc<AlertEngine>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    // ---
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Alert evaluation loop shutting down");
                break;
            }

            _ = ticker.tick() => {
                match engine.evaluate_all_sites().await {
                    Ok(summary) if summary.fired + summary.cleared + summary.failed > 0 => {
                        info!(
                            "Evaluation tick: fired={} cleared={} failed={}",
                            summary.fired, summary.cleared, summary.failed
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("Evaluation tick failed: {}", e),
                }
            }
        }
    }
}

/// Close sessions silent for longer than `stale_after`, every `interval`.
pub async fn reaper_loop(
    sessions: Arc<SessionManager>,
    interval: Duration,
    stale_after: Duration,
    shutdown: CancellationToken,
) {
    // ---
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Skip the immediate first tick; nothing can be stale at startup
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Session reaper shutting down");
                break;
            }

            _ = ticker.tick() => {
                if let Err(e) = sessions.reap_stale(stale_after).await {
                    error!("Session reaper failed: {}", e);
                }
            }
        }
    }
}
