//! Background expiration sweep.
//!
//! When configured with a nonzero interval, a task wakes periodically and
//! reaps expired entries via [`Cache::sweep_expired`]. Lazy expiry on the
//! read path works independently of the sweeper.
//!
//! [`Cache::sweep_expired`]: super::engine::Cache::sweep_expired

use super::engine::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spawn the sweep task. Returns `None` when `interval_ms` is zero.
pub fn spawn(
    cache: Arc<Cache>,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if interval_ms == 0 {
        return None;
    }
    let interval = Duration::from_millis(interval_ms);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so a freshly
        // started cache is not swept before anything can expire.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = cache.sweep_expired().await;
                    if removed > 0 {
                        tracing::debug!(removed, remaining = cache.size(), "expiration sweep");
                    }
                }
                _ = shutdown.changed() => {
                    tracing::debug!("expiration sweeper stopping");
                    return;
                }
            }
        }
    }))
}
