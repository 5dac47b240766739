//! StaleReaper: periodic sweep that evicts workers whose heartbeat has expired.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::registry::CapabilityRegistry;

/// Spawn the reaper task. Runs every `reap_interval_seconds` until `shutdown`
/// fires. A failed sweep is logged and never crashes the process — the next
/// tick retries.
pub fn spawn(
    registry: Arc<CapabilityRegistry>,
    reap_interval_seconds: u64,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(reap_interval_seconds.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = registry.cleanup_stale(chrono::Utc::now());
                    if removed > 0 {
                        info!(removed, "stale reaper evicted workers");
                    } else {
                        debug!("stale reaper tick: nothing to evict");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("stale reaper stopping");
                        break;
                    }
                }
            }
        }
    })
}
