//! Channel- and key-level cooldown timers (spec §4.1).
//!
//! The in-memory tables are the hot-path source of truth; the store is
//! written through on every bump for restart durability but a
//! persistence failure never blocks or reverts the in-memory update.

use std::collections::HashMap;
use std::sync::Arc;

use ccload_common::{ChannelId, KeyIndex};
use ccload_storage::Store;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct CooldownCounts {
    pub channels: usize,
    pub keys: usize,
}

pub struct CooldownManager {
    store: Arc<dyn Store>,
    ceiling: TimeDuration,
    channels: RwLock<HashMap<ChannelId, OffsetDateTime>>,
    keys: RwLock<HashMap<(ChannelId, KeyIndex), OffsetDateTime>>,
}

impl CooldownManager {
    pub fn new(store: Arc<dyn Store>, ceiling_secs: u64) -> Self {
        Self {
            store,
            ceiling: TimeDuration::seconds(ceiling_secs as i64),
            channels: RwLock::new(HashMap::new()),
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Loads all not-yet-expired cooldowns from the store at startup;
    /// expired rows are left behind (they age out of the store's own
    /// cleanup path, not this manager's concern).
    pub async fn load_from_store(&self) -> Result<(), ccload_storage::StorageError> {
        let now = OffsetDateTime::now_utc();
        let channel_rows = self.store.get_all_channel_cooldowns().await?;
        let mut channels = self.channels.write().await;
        for (id, expires_at) in channel_rows {
            if expires_at > now {
                channels.insert(id, expires_at);
            }
        }
        drop(channels);

        let key_rows = self.store.get_all_key_cooldowns().await?;
        let mut keys = self.keys.write().await;
        for (id, key_index, expires_at) in key_rows {
            if expires_at > now {
                keys.insert((id, key_index), expires_at);
            }
        }
        Ok(())
    }

    pub async fn is_channel_cooled(&self, id: ChannelId) -> bool {
        let guard = self.channels.read().await;
        guard.get(&id).is_some_and(|exp| OffsetDateTime::now_utc() < *exp)
    }

    pub async fn is_key_cooled(&self, id: ChannelId, key_index: KeyIndex) -> bool {
        let guard = self.keys.read().await;
        guard
            .get(&(id, key_index))
            .is_some_and(|exp| OffsetDateTime::now_utc() < *exp)
    }

    pub async fn all_channel_cooldowns(&self) -> HashMap<ChannelId, OffsetDateTime> {
        self.channels.read().await.clone()
    }

    pub async fn all_key_cooldowns(&self) -> HashMap<(ChannelId, KeyIndex), OffsetDateTime> {
        self.keys.read().await.clone()
    }

    /// `expiry = max(current_expiry, now + duration)`, capped by the
    /// ceiling (invariant 1: Bump never lowers the stored expiry).
    pub async fn bump_channel(&self, id: ChannelId, duration: TimeDuration) {
        let duration = duration.min(self.ceiling);
        let candidate = OffsetDateTime::now_utc() + duration;
        let mut guard = self.channels.write().await;
        let next = match guard.get(&id) {
            Some(current) if *current > candidate => *current,
            _ => candidate,
        };
        guard.insert(id, next);
        drop(guard);

        if let Err(err) = self.store.set_channel_cooldown(id, next).await {
            warn!(event = "cooldown_persist_failed", channel_id = id, error = %err, "failed to persist channel cooldown");
        }
    }

    pub async fn bump_key(&self, id: ChannelId, key_index: KeyIndex, duration: TimeDuration) {
        let duration = duration.min(self.ceiling);
        let candidate = OffsetDateTime::now_utc() + duration;
        let mut guard = self.keys.write().await;
        let next = match guard.get(&(id, key_index)) {
            Some(current) if *current > candidate => *current,
            _ => candidate,
        };
        guard.insert((id, key_index), next);
        drop(guard);

        if let Err(err) = self.store.set_key_cooldown(id, key_index, next).await {
            warn!(event = "cooldown_persist_failed", channel_id = id, key_index, error = %err, "failed to persist key cooldown");
        }
    }

    pub async fn clear_channel(&self, id: ChannelId) {
        self.channels.write().await.remove(&id);
        if let Err(err) = self.store.clear_channel_cooldown(id).await {
            warn!(event = "cooldown_clear_failed", channel_id = id, error = %err, "failed to clear channel cooldown");
        }
    }

    pub async fn clear_key(&self, id: ChannelId, key_index: KeyIndex) {
        self.keys.write().await.remove(&(id, key_index));
        if let Err(err) = self.store.clear_key_cooldown(id, key_index).await {
            warn!(event = "cooldown_clear_failed", channel_id = id, key_index, error = %err, "failed to clear key cooldown");
        }
    }

    /// Removes every key cooldown for a deleted channel; cascades the
    /// channel-disappearance invariant of §3.
    pub async fn remove_channel(&self, id: ChannelId) {
        self.channels.write().await.remove(&id);
        self.keys.write().await.retain(|(cid, _), _| *cid != id);
    }

    pub async fn counts(&self) -> CooldownCounts {
        let now = OffsetDateTime::now_utc();
        let channels = self.channels.read().await;
        let keys = self.keys.read().await;
        CooldownCounts {
            channels: channels.values().filter(|exp| now < **exp).count(),
            keys: keys.values().filter(|exp| now < **exp).count(),
        }
    }
}

/// Exponential backoff for repeated failures against the same
/// channel/key, bounded by `ceiling`. `attempt` is 0-based (first
/// failure is attempt 0).
pub fn exponential_backoff(base: TimeDuration, attempt: u32, ceiling: TimeDuration) -> TimeDuration {
    let factor = 1i64.checked_shl(attempt.min(16)).unwrap_or(i64::MAX);
    let scaled = base.whole_seconds().saturating_mul(factor);
    TimeDuration::seconds(scaled).min(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccload_storage::SeaOrmStore;

    async fn manager() -> CooldownManager {
        let store = SeaOrmStore::connect("sqlite::memory:").await.unwrap();
        store.sync().await.unwrap();
        CooldownManager::new(Arc::new(store), 3600)
    }

    #[tokio::test]
    async fn bump_is_monotonic() {
        let mgr = manager().await;
        mgr.bump_channel(1, TimeDuration::seconds(120)).await;
        let first = *mgr.channels.read().await.get(&1).unwrap();
        mgr.bump_channel(1, TimeDuration::seconds(10)).await;
        let second = *mgr.channels.read().await.get(&1).unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn bump_is_capped_by_ceiling() {
        let mgr = manager().await;
        mgr.bump_channel(1, TimeDuration::seconds(10_000)).await;
        let expiry = *mgr.channels.read().await.get(&1).unwrap();
        let bound = OffsetDateTime::now_utc() + TimeDuration::seconds(3600);
        assert!(expiry <= bound + TimeDuration::seconds(1));
    }

    #[tokio::test]
    async fn is_channel_cooled_reflects_expiry() {
        let mgr = manager().await;
        assert!(!mgr.is_channel_cooled(1).await);
        mgr.bump_channel(1, TimeDuration::seconds(60)).await;
        assert!(mgr.is_channel_cooled(1).await);
    }

    #[tokio::test]
    async fn remove_channel_cascades_to_keys() {
        let mgr = manager().await;
        mgr.bump_channel(1, TimeDuration::seconds(60)).await;
        mgr.bump_key(1, 0, TimeDuration::seconds(60)).await;
        mgr.remove_channel(1).await;
        assert!(!mgr.is_channel_cooled(1).await);
        assert!(!mgr.is_key_cooled(1, 0).await);
    }

    #[test]
    fn exponential_backoff_caps_at_ceiling() {
        let ceiling = TimeDuration::seconds(600);
        let d = exponential_backoff(TimeDuration::seconds(10), 10, ceiling);
        assert_eq!(d, ceiling);
    }
}
