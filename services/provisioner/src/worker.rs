//! Background loops: announcement intake and registry sweeping.

use std::time::Duration;

use fleet_bus::Subscription;
use fleet_messages::{decode, Announcement};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::provisioner::Provisioner;

/// Feed every announcement into the registry until shutdown.
pub async fn run_announce_listener(
    provisioner: Provisioner,
    mut announcements: Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = announcements.next() => {
                let Some(message) = message else {
                    warn!("Announce subscription closed");
                    break;
                };
                match decode::<Announcement>(&message.payload) {
                    Ok(announcement) => provisioner.on_announcement(&announcement),
                    Err(e) => warn!(error = %e, "Ignoring malformed announcement"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Announce listener shutting down");
                    break;
                }
            }
        }
    }
}

/// Periodically drop nodes that stopped announcing.
pub async fn run_sweep_loop(
    provisioner: Provisioner,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // Don't sweep on startup - wait for first interval
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = provisioner.sweep_registry();
                if !expired.is_empty() {
                    info!(
                        expired = expired.len(),
                        live = provisioner.live_node_count(),
                        "Registry sweep complete"
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Registry sweeper shutting down");
                    break;
                }
            }
        }
    }
}
