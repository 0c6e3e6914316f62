use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hub::engine::Hub;

/// Periodically pull messages created on other nodes for every channel
/// this node serves.
pub async fn run_channel_sync(hub: Arc<Hub>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_secs = period.as_secs(), "Channel sync loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let delivered = hub.sync_served_channels().await;
                if delivered > 0 {
                    debug!(delivered, "Delivered messages pulled from registry");
                }
            }
        }
    }

    info!("Channel sync loop stopped");
}
