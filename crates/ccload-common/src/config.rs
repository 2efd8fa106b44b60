use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: compiled-in defaults < `system_settings` row < process
/// environment. Held behind an `ArcSwap` in `ccload-core`; a setting
/// change triggers a graceful shutdown and re-bootstrap rather than an
/// in-place hot reload (see design notes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a hash (blake3), never plaintext.
    pub admin_pass_hash: String,
    /// Static caller tokens accepted by the surrounding auth middleware.
    pub auth_tokens: Vec<String>,
    pub dsn: String,
    pub proxy: Option<String>,
    pub skip_tls_verify: bool,

    pub max_key_retries: u32,
    pub first_byte_timeout_secs: u64,
    pub max_concurrency: usize,
    pub shutdown_timeout_secs: u64,

    pub log_buffer: usize,
    pub log_workers: usize,
    pub log_retention_days: i64,

    pub model_lookup_strip_date_suffix: bool,
    pub model_fuzzy_match: bool,

    pub health_score_enabled: bool,
    pub health_window_minutes: i64,
    pub health_update_interval_seconds: u64,

    pub cooldown_ceiling_secs: u64,
}

/// Optional layer used for merging global config; every field mirrors
/// `GlobalConfig` but is optional so a partial admin write or partial
/// env can be overlaid without clobbering unrelated fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_pass_hash: Option<String>,
    pub auth_tokens: Option<Vec<String>>,
    pub dsn: Option<String>,
    pub proxy: Option<String>,
    pub skip_tls_verify: Option<bool>,

    pub max_key_retries: Option<u32>,
    pub first_byte_timeout_secs: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub shutdown_timeout_secs: Option<u64>,

    pub log_buffer: Option<usize>,
    pub log_workers: Option<usize>,
    pub log_retention_days: Option<i64>,

    pub model_lookup_strip_date_suffix: Option<bool>,
    pub model_fuzzy_match: Option<bool>,

    pub health_score_enabled: Option<bool>,
    pub health_window_minutes: Option<i64>,
    pub health_update_interval_seconds: Option<u64>,

    pub cooldown_ceiling_secs: Option<u64>,
}

impl GlobalConfigPatch {
    /// Overlays `other` onto `self`, `other` winning wherever it sets
    /// a field. Used to layer CLI/env on top of stored settings.
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(host);
        take!(port);
        take!(admin_pass_hash);
        take!(auth_tokens);
        take!(dsn);
        take!(proxy);
        take!(skip_tls_verify);
        take!(max_key_retries);
        take!(first_byte_timeout_secs);
        take!(max_concurrency);
        take!(shutdown_timeout_secs);
        take!(log_buffer);
        take!(log_workers);
        take!(log_retention_days);
        take!(model_lookup_strip_date_suffix);
        take!(model_fuzzy_match);
        take!(health_score_enabled);
        take!(health_window_minutes);
        take!(health_update_interval_seconds);
        take!(cooldown_ceiling_secs);
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8080),
            admin_pass_hash: self
                .admin_pass_hash
                .ok_or(GlobalConfigError::MissingField("admin_pass_hash"))?,
            auth_tokens: self.auth_tokens.unwrap_or_default(),
            dsn: self
                .dsn
                .unwrap_or_else(|| "sqlite://ccload.db?mode=rwc".to_string()),
            proxy: self.proxy,
            skip_tls_verify: self.skip_tls_verify.unwrap_or(false),
            max_key_retries: self.max_key_retries.unwrap_or(3).max(1),
            first_byte_timeout_secs: self.first_byte_timeout_secs.unwrap_or(120),
            max_concurrency: self.max_concurrency.unwrap_or(1000),
            shutdown_timeout_secs: self.shutdown_timeout_secs.unwrap_or(30),
            log_buffer: self.log_buffer.unwrap_or(4096),
            log_workers: self.log_workers.unwrap_or(2),
            log_retention_days: self.log_retention_days.unwrap_or(30),
            model_lookup_strip_date_suffix: self.model_lookup_strip_date_suffix.unwrap_or(true),
            model_fuzzy_match: self.model_fuzzy_match.unwrap_or(false),
            health_score_enabled: self.health_score_enabled.unwrap_or(true),
            health_window_minutes: self.health_window_minutes.unwrap_or(60),
            health_update_interval_seconds: self.health_update_interval_seconds.unwrap_or(60),
            cooldown_ceiling_secs: self.cooldown_ceiling_secs.unwrap_or(3600),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_pass_hash: Some(value.admin_pass_hash),
            auth_tokens: Some(value.auth_tokens),
            dsn: Some(value.dsn),
            proxy: value.proxy,
            skip_tls_verify: Some(value.skip_tls_verify),
            max_key_retries: Some(value.max_key_retries),
            first_byte_timeout_secs: Some(value.first_byte_timeout_secs),
            max_concurrency: Some(value.max_concurrency),
            shutdown_timeout_secs: Some(value.shutdown_timeout_secs),
            log_buffer: Some(value.log_buffer),
            log_workers: Some(value.log_workers),
            log_retention_days: Some(value.log_retention_days),
            model_lookup_strip_date_suffix: Some(value.model_lookup_strip_date_suffix),
            model_fuzzy_match: Some(value.model_fuzzy_match),
            health_score_enabled: Some(value.health_score_enabled),
            health_window_minutes: Some(value.health_window_minutes),
            health_update_interval_seconds: Some(value.health_update_interval_seconds),
            cooldown_ceiling_secs: Some(value.cooldown_ceiling_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_other_when_set() {
        let mut base = GlobalConfigPatch {
            port: Some(1),
            ..Default::default()
        };
        base.overlay(GlobalConfigPatch {
            port: Some(2),
            ..Default::default()
        });
        assert_eq!(base.port, Some(2));
    }

    #[test]
    fn overlay_keeps_base_when_other_unset() {
        let mut base = GlobalConfigPatch {
            host: Some("127.0.0.1".to_string()),
            ..Default::default()
        };
        base.overlay(GlobalConfigPatch::default());
        assert_eq!(base.host.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn into_config_rejects_missing_required_field() {
        let patch = GlobalConfigPatch::default();
        let err = patch.into_config().unwrap_err();
        matches!(err, GlobalConfigError::MissingField("admin_pass_hash"));
    }
}
