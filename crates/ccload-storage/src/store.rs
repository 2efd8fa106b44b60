use async_trait::async_trait;
use ccload_common::{ChannelId, ChannelType, KeyIndex};
use time::OffsetDateTime;

use crate::error::StorageResult;
use crate::types::{ApiKey, Channel, ChannelSuccessRate, LogEntry, NewChannel, UsageAggregate};

#[derive(Debug, Clone)]
pub struct UsageAggregateFilter {
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
    pub channel_id: Option<ChannelId>,
    pub model: Option<String>,
}

/// Persistence abstraction consumed by the core. Runtime request
/// handling reads from in-memory snapshots derived from this trait,
/// never the store directly, except for the cooldown and telemetry
/// writes the spec calls out as persisted.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_configs(&self) -> StorageResult<Vec<Channel>>;
    async fn get_config(&self, id: ChannelId) -> StorageResult<Option<Channel>>;
    async fn get_enabled_channels_by_model(&self, model: &str) -> StorageResult<Vec<Channel>>;
    async fn get_enabled_channels_by_type(&self, t: ChannelType) -> StorageResult<Vec<Channel>>;
    async fn create_config(&self, channel: NewChannel) -> StorageResult<ChannelId>;
    async fn update_config(&self, id: ChannelId, channel: NewChannel) -> StorageResult<()>;
    async fn delete_config(&self, id: ChannelId) -> StorageResult<()>;

    async fn get_api_keys(&self, channel_id: ChannelId) -> StorageResult<Vec<ApiKey>>;
    async fn get_all_api_keys(&self) -> StorageResult<Vec<ApiKey>>;
    async fn create_api_keys_batch(
        &self,
        channel_id: ChannelId,
        secrets: &[String],
    ) -> StorageResult<()>;

    async fn get_channel_cooldown(
        &self,
        id: ChannelId,
    ) -> StorageResult<Option<OffsetDateTime>>;
    async fn set_channel_cooldown(
        &self,
        id: ChannelId,
        expires_at: OffsetDateTime,
    ) -> StorageResult<()>;
    async fn get_all_channel_cooldowns(
        &self,
    ) -> StorageResult<Vec<(ChannelId, OffsetDateTime)>>;
    async fn clear_channel_cooldown(&self, id: ChannelId) -> StorageResult<()>;

    async fn get_key_cooldown(
        &self,
        id: ChannelId,
        key_index: KeyIndex,
    ) -> StorageResult<Option<OffsetDateTime>>;
    async fn set_key_cooldown(
        &self,
        id: ChannelId,
        key_index: KeyIndex,
        expires_at: OffsetDateTime,
    ) -> StorageResult<()>;
    async fn get_all_key_cooldowns(
        &self,
    ) -> StorageResult<Vec<(ChannelId, KeyIndex, OffsetDateTime)>>;
    async fn clear_key_cooldown(&self, id: ChannelId, key_index: KeyIndex) -> StorageResult<()>;

    async fn add_log(&self, entry: LogEntry) -> StorageResult<()>;
    async fn batch_add_logs(&self, entries: &[LogEntry]) -> StorageResult<()>;
    async fn list_logs_range(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<LogEntry>>;
    async fn count_logs_range(&self, from: OffsetDateTime, to: OffsetDateTime) -> StorageResult<i64>;
    async fn cleanup_logs_before(&self, cutoff: OffsetDateTime) -> StorageResult<u64>;

    async fn aggregate(&self, filter: UsageAggregateFilter) -> StorageResult<UsageAggregate>;
    async fn get_channel_success_rates(
        &self,
        since: OffsetDateTime,
    ) -> StorageResult<Vec<ChannelSuccessRate>>;
    async fn get_distinct_models(&self) -> StorageResult<Vec<String>>;

    async fn get_setting(&self, key: &str) -> StorageResult<Option<String>>;
    async fn update_setting(&self, key: &str, value: &str) -> StorageResult<()>;
    async fn batch_update_settings(&self, entries: &[(String, String)]) -> StorageResult<()>;
    async fn list_all_settings(&self) -> StorageResult<Vec<(String, String)>>;

    async fn ping(&self) -> StorageResult<()>;
}
