pub mod api_key;
pub mod channel;
pub mod channel_cooldown;
pub mod key_cooldown;
pub mod log_entry;
pub mod setting;
