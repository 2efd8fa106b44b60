//! Read-mostly channel and key-secret snapshots (spec §9 "read-mostly
//! caches with invalidation"): one atomic pointer per table, refreshed
//! from the store and swapped whole so readers never observe a partial
//! update.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ccload_common::{ChannelId, ChannelType, KeyIndex};
use ccload_storage::Store;
use ccload_storage::types::Channel;

#[derive(Default)]
pub struct ChannelCache {
    snapshot: ArcSwap<Vec<Channel>>,
    keys: ArcSwap<HashMap<(ChannelId, KeyIndex), String>>,
}

impl ChannelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn refresh(&self, store: &dyn Store) -> Result<(), ccload_storage::StorageError> {
        let channels = store.list_configs().await?;
        self.snapshot.store(Arc::new(channels));

        let keys = store.get_all_api_keys().await?;
        let map = keys
            .into_iter()
            .map(|k| ((k.channel_id, k.key_index), k.secret))
            .collect();
        self.keys.store(Arc::new(map));
        Ok(())
    }

    pub fn all(&self) -> Arc<Vec<Channel>> {
        self.snapshot.load_full()
    }

    pub fn by_type(&self, channel_type: ChannelType) -> Vec<Channel> {
        self.snapshot
            .load()
            .iter()
            .filter(|c| c.channel_type == channel_type)
            .cloned()
            .collect()
    }

    pub fn by_id(&self, id: ChannelId) -> Option<Channel> {
        self.snapshot.load().iter().find(|c| c.id == id).cloned()
    }

    pub fn secret(&self, channel_id: ChannelId, key_index: KeyIndex) -> Option<String> {
        self.keys.load().get(&(channel_id, key_index)).cloned()
    }
}
