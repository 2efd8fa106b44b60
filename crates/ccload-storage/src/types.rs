use ccload_common::{ChannelId, ChannelType, KeyIndex, KeyStrategy};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub redirect: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub url: String,
    pub channel_type: ChannelType,
    pub priority: i32,
    pub enabled: bool,
    pub models: Vec<ModelEntry>,
    pub key_strategy: KeyStrategy,
    pub key_count: u32,
}

#[derive(Debug, Clone)]
pub struct NewChannel {
    pub name: String,
    pub url: String,
    pub channel_type: ChannelType,
    pub priority: i32,
    pub enabled: bool,
    pub models: Vec<ModelEntry>,
    pub key_strategy: KeyStrategy,
    pub api_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub channel_id: ChannelId,
    pub key_index: KeyIndex,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub at: OffsetDateTime,
    pub channel_id: Option<ChannelId>,
    pub model: Option<String>,
    pub caller_token_hash: Option<String>,
    pub caller_token_id: Option<String>,
    pub status: i32,
    pub duration_ms: i64,
    pub first_byte_ms: Option<i64>,
    pub is_stream: bool,
    pub message: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default)]
pub struct UsageAggregate {
    pub matched_rows: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct ChannelSuccessRate {
    pub channel_id: ChannelId,
    pub success_rate: f64,
    pub sample_count: u64,
}
