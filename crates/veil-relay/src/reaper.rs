use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::debug;

use crate::relay::Relay;

/// Hourly (by default) mailbox expiry across all users.
pub fn spawn_mailbox_reaper(relay: Arc<Relay>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = relay.sweep_mailboxes();
            debug!(expired = stats.expired, removed = stats.mailboxes_removed, "mailbox sweep");
        }
    })
}

/// Removes stored assets and stalled uploads past their TTL.
pub fn spawn_asset_reaper(relay: Arc<Relay>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let (assets, uploads) = relay.sweep_assets();
            debug!(assets, uploads, "asset sweep");
        }
    })
}
