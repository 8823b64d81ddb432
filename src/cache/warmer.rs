use super::{MetadataCache, RefreshOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Background task that keeps the plugin cache warm between list requests.
pub struct CacheWarmer {
    cache: Arc<MetadataCache>,
    refresh_interval: Duration,
    shutdown_rx: broadcast::Receiver<()>,
}

impl CacheWarmer {
    pub fn new(
        cache: Arc<MetadataCache>,
        refresh_interval: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            cache,
            refresh_interval,
            shutdown_rx,
        }
    }

    /// Sweep once immediately, then re-check staleness every interval until shutdown.
    pub async fn run(mut self) {
        info!(
            "Starting cache warmer (refresh every {}s)",
            self.refresh_interval.as_secs()
        );

        let mut ticker = interval(self.refresh_interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.cache.refresh_if_stale(false).await {
                        RefreshOutcome::Fresh => debug!("Cache warmer tick - cache still fresh"),
                        outcome => debug!("Cache warmer tick - {:?}", outcome),
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Cache warmer stopped");
                    break;
                }
            }
        }
    }
}
