pub mod config;
pub mod ids;

pub use config::{GlobalConfig, GlobalConfigError, GlobalConfigPatch};
pub use ids::{ChannelId, ChannelType, KeyIndex, KeyStrategy};
