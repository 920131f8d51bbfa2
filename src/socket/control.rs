use std::time::Duration;

use embedded_hal::digital::OutputPin;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::Shared;
use crate::relay::Relay;

/// Poll the mailbox every `poll_interval` while the shared running flag holds.
pub async fn run<P: OutputPin>(relay: &mut Relay<P>, shared: &Shared, poll_interval: Duration) {
    info!("Running...");
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while shared.is_running() {
        ticker.tick().await;
        drain(relay, shared).await;
    }
    info!("Control loop stopped");
}

/// Apply the pending command, if any, and tell every client about it.
pub async fn drain<P: OutputPin>(relay: &mut Relay<P>, shared: &Shared) -> Option<bool> {
    let state = shared.mailbox.take().await?;
    info!("Updated to {}", state);
    if let Err(e) = relay.set(state) {
        error!("Failed to switch relay: {}", e);
    }
    shared.registry.broadcast(state);
    Some(state)
}
