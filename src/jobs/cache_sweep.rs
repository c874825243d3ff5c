//! Background job: sweep expired lookup cache entries.
//!
//! Reads already evict lazily; this bounds memory for keys that are never
//! read again (one-off fingerprints, rotated tokens).

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::cache::LookupCache;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the background sweep task. Call this once at startup.
pub fn spawn(cache: LookupCache) -> JoinHandle<()> {
    spawn_every(cache, SWEEP_INTERVAL)
}

pub fn spawn_every(cache: LookupCache, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let evicted = cache.evict_expired();
            if evicted > 0 {
                tracing::debug!(evicted, remaining = cache.len(), "swept expired cache entries");
            }
        }
    })
}
