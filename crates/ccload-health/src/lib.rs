//! Rolling success-rate snapshot per channel (spec §4.3).
//!
//! Published as an atomic pointer swap so readers never take a lock,
//! matching the read-mostly-cache design note the rest of the core
//! follows for the channel cache and caller-token directory.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ccload_common::ChannelId;
use ccload_storage::Store;
use time::{Duration as TimeDuration, OffsetDateTime};

#[derive(Debug, Clone, Copy)]
pub struct HealthEntry {
    pub success_rate: f64,
    pub sample_count: u64,
}

const MIN_SAMPLE_COUNT: u64 = 10;

pub struct HealthCache {
    snapshot: ArcSwap<HashMap<ChannelId, HealthEntry>>,
}

impl Default for HealthCache {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthCache {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Success rate for `id`, defaulting to 1.0 when absent or under
    /// the minimum sample count (spec §4.2 step 3).
    pub fn success_rate(&self, id: ChannelId) -> f64 {
        match self.snapshot.load().get(&id) {
            Some(entry) if entry.sample_count >= MIN_SAMPLE_COUNT => entry.success_rate,
            _ => 1.0,
        }
    }

    pub fn snapshot(&self) -> Arc<HashMap<ChannelId, HealthEntry>> {
        self.snapshot.load_full()
    }

    /// Recomputes the whole map from the store and swaps it in one
    /// shot; a disabled configuration should simply not call this and
    /// leave the map empty (all lookups default to 1.0).
    pub async fn refresh(
        &self,
        store: &dyn Store,
        window_minutes: i64,
    ) -> Result<(), ccload_storage::StorageError> {
        let since = OffsetDateTime::now_utc() - TimeDuration::minutes(window_minutes);
        let rates = store.get_channel_success_rates(since).await?;
        let mut next = HashMap::with_capacity(rates.len());
        for rate in rates {
            next.insert(
                rate.channel_id,
                HealthEntry {
                    success_rate: rate.success_rate,
                    sample_count: rate.sample_count,
                },
            );
        }
        self.snapshot.store(Arc::new(next));
        Ok(())
    }
}

/// Spawns the periodic refresh loop; exits once `shutdown` fires.
pub fn spawn_refresh_loop(
    cache: Arc<HealthCache>,
    store: Arc<dyn Store>,
    window_minutes: i64,
    interval_secs: u64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = cache.refresh(store.as_ref(), window_minutes).await {
                        tracing::warn!(event = "health_refresh_failed", error = %err, "health cache refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_one_when_absent() {
        let cache = HealthCache::new();
        assert_eq!(cache.success_rate(42), 1.0);
    }

    #[test]
    fn defaults_to_one_under_min_sample_count() {
        let cache = HealthCache::new();
        let mut map = HashMap::new();
        map.insert(
            1,
            HealthEntry {
                success_rate: 0.2,
                sample_count: 3,
            },
        );
        cache.snapshot.store(Arc::new(map));
        assert_eq!(cache.success_rate(1), 1.0);
    }

    #[test]
    fn uses_rate_once_min_sample_count_reached() {
        let cache = HealthCache::new();
        let mut map = HashMap::new();
        map.insert(
            1,
            HealthEntry {
                success_rate: 0.5,
                sample_count: 50,
            },
        );
        cache.snapshot.store(Arc::new(map));
        assert_eq!(cache.success_rate(1), 0.5);
    }
}
