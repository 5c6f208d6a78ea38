//! Announce loop for advertising node capacity to provisioners.
//!
//! The node agent broadcasts its announcement on the shared announce subject:
//! - once immediately at startup (the first interval tick)
//! - then every `announce_interval_secs`
//!
//! Provisioners use these to size discovery rounds; discover requests are
//! answered separately by the agent's discover handler.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::agent::NodeAgent;

/// Run the announce loop until shutdown.
pub async fn run_announce_loop(
    agent: NodeAgent,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        node_id = %agent.node_id(),
        interval_secs = interval.as_secs(),
        "Starting announce loop"
    );

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                match agent.announce(None).await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        debug!(
                            available_memory_mb = agent.available_memory_mb(),
                            "Announced"
                        );
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(
                                error = %e,
                                consecutive_failures,
                                "Announcement failed"
                            );
                        } else {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "Announcement failed repeatedly"
                            );
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Announce loop shutting down");
                    break;
                }
            }
        }
    }
}
