//! Startup wiring (spec §6): merges CLI/env/store configuration, syncs
//! the schema, seeds the admin credential, and builds `AppState`. Merge
//! order is CLI/ENV (clap gives CLI priority over env per field) layered
//! on top of whatever was last persisted to the settings table.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use ccload_common::{GlobalConfig, GlobalConfigPatch};
use ccload_storage::{SeaOrmStore, Store};
use clap::Parser;

use crate::state::AppState;

#[derive(Debug, Clone, Parser)]
#[command(name = "ccload", version, about = "Multi-tenant LLM reverse proxy")]
pub struct CliArgs {
    #[arg(long, env = "CCLOAD_DSN")]
    pub dsn: Option<String>,
    #[arg(long, env = "CCLOAD_HOST")]
    pub host: Option<String>,
    #[arg(long, env = "CCLOAD_PORT")]
    pub port: Option<String>,
    /// Admin password (plaintext). Stored as a blake3 hash.
    #[arg(long, env = "CCLOAD_PASS")]
    pub admin_pass: Option<String>,
    /// Comma-separated static caller tokens accepted by the proxy surface.
    #[arg(long, env = "CCLOAD_AUTH")]
    pub auth_tokens: Option<String>,
    #[arg(long, env = "CCLOAD_PROXY")]
    pub proxy: Option<String>,
    #[arg(long, env = "CCLOAD_SKIP_TLS_VERIFY")]
    pub skip_tls_verify: Option<String>,
    #[arg(long, env = "CCLOAD_MAX_KEY_RETRIES")]
    pub max_key_retries: Option<String>,
    #[arg(long, env = "CCLOAD_FIRST_BYTE_TIMEOUT")]
    pub first_byte_timeout_secs: Option<String>,
    #[arg(long, env = "CCLOAD_MAX_CONCURRENCY")]
    pub max_concurrency: Option<String>,
    #[arg(long, env = "CCLOAD_SHUTDOWN_TIMEOUT_SECS")]
    pub shutdown_timeout_secs: Option<String>,
    #[arg(long, env = "CCLOAD_LOG_BUFFER")]
    pub log_buffer: Option<String>,
    #[arg(long, env = "CCLOAD_LOG_WORKERS")]
    pub log_workers: Option<String>,
    #[arg(long, env = "CCLOAD_LOG_RETENTION_DAYS")]
    pub log_retention_days: Option<String>,
}

pub struct Bootstrap {
    pub store: Arc<SeaOrmStore>,
    pub state: Arc<AppState>,
    pub worker_handles: Vec<tokio::task::JoinHandle<()>>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let dsn = sanitize_dsn_value(args.dsn.clone());
    ensure_sqlite_parent_dir(&dsn)?;

    let store = Arc::new(SeaOrmStore::connect(&dsn).await.context("connect storage")?);
    store.sync().await.context("schema sync")?;

    let mut merged = load_patch_from_settings(store.as_ref()).await?;

    let mut admin_pass_hash_override: Option<String> = None;
    if let Some(plain) = sanitize_optional_env_value(args.admin_pass.clone()) {
        admin_pass_hash_override = Some(hash_admin_key(&plain));
    } else if merged.admin_pass_hash.is_none() {
        let plain = generate_admin_key();
        eprintln!("generated admin password: {plain}");
        admin_pass_hash_override = Some(hash_admin_key(&plain));
    }

    let cli_patch = GlobalConfigPatch {
        host: sanitize_optional_env_value(args.host.clone()),
        port: parse_u16_env_value(args.port.clone(), "CCLOAD_PORT")?,
        admin_pass_hash: admin_pass_hash_override,
        auth_tokens: sanitize_optional_env_value(args.auth_tokens.clone())
            .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()),
        dsn: Some(dsn),
        proxy: sanitize_optional_env_value(args.proxy.clone()),
        skip_tls_verify: parse_bool_env_value(args.skip_tls_verify.clone(), "CCLOAD_SKIP_TLS_VERIFY")?,
        max_key_retries: parse_u32_env_value(args.max_key_retries.clone(), "CCLOAD_MAX_KEY_RETRIES")?,
        first_byte_timeout_secs: parse_u64_env_value(
            args.first_byte_timeout_secs.clone(),
            "CCLOAD_FIRST_BYTE_TIMEOUT",
        )?,
        max_concurrency: parse_usize_env_value(args.max_concurrency.clone(), "CCLOAD_MAX_CONCURRENCY")?,
        shutdown_timeout_secs: parse_u64_env_value(
            args.shutdown_timeout_secs.clone(),
            "CCLOAD_SHUTDOWN_TIMEOUT_SECS",
        )?,
        log_buffer: parse_usize_env_value(args.log_buffer.clone(), "CCLOAD_LOG_BUFFER")?,
        log_workers: parse_usize_env_value(args.log_workers.clone(), "CCLOAD_LOG_WORKERS")?,
        log_retention_days: parse_i64_env_value(args.log_retention_days.clone(), "CCLOAD_LOG_RETENTION_DAYS")?,
        model_lookup_strip_date_suffix: None,
        model_fuzzy_match: None,
        health_score_enabled: None,
        health_window_minutes: None,
        health_update_interval_seconds: None,
        cooldown_ceiling_secs: None,
    };
    merged.overlay(cli_patch);

    let global: GlobalConfig = merged.into_config().context("finalize merged global config")?;
    persist_patch(store.as_ref(), &GlobalConfigPatch::from(global.clone())).await?;

    let store_dyn: Arc<dyn Store> = store.clone();
    let (state, worker_handles) = AppState::build(global, store_dyn)
        .await
        .context("build app state")?;

    Ok(Bootstrap {
        store,
        state,
        worker_handles,
    })
}

const SETTINGS_PREFIX: &str = "global.";

pub async fn load_patch_from_settings(store: &dyn Store) -> anyhow::Result<GlobalConfigPatch> {
    let rows = store.list_all_settings().await.context("load settings")?;
    let mut patch = GlobalConfigPatch::default();
    for (key, value) in rows {
        let Some(field) = key.strip_prefix(SETTINGS_PREFIX) else {
            continue;
        };
        apply_setting(&mut patch, field, &value);
    }
    Ok(patch)
}

pub fn apply_setting(patch: &mut GlobalConfigPatch, field: &str, value: &str) {
    match field {
        "host" => patch.host = Some(value.to_string()),
        "port" => patch.port = value.parse().ok(),
        "admin_pass_hash" => patch.admin_pass_hash = Some(value.to_string()),
        "auth_tokens" => patch.auth_tokens = Some(value.split(',').map(str::to_string).collect()),
        "dsn" => patch.dsn = Some(value.to_string()),
        "proxy" => patch.proxy = Some(value.to_string()),
        "skip_tls_verify" => patch.skip_tls_verify = value.parse().ok(),
        "max_key_retries" => patch.max_key_retries = value.parse().ok(),
        "first_byte_timeout_secs" => patch.first_byte_timeout_secs = value.parse().ok(),
        "max_concurrency" => patch.max_concurrency = value.parse().ok(),
        "shutdown_timeout_secs" => patch.shutdown_timeout_secs = value.parse().ok(),
        "log_buffer" => patch.log_buffer = value.parse().ok(),
        "log_workers" => patch.log_workers = value.parse().ok(),
        "log_retention_days" => patch.log_retention_days = value.parse().ok(),
        "model_lookup_strip_date_suffix" => patch.model_lookup_strip_date_suffix = value.parse().ok(),
        "model_fuzzy_match" => patch.model_fuzzy_match = value.parse().ok(),
        "health_score_enabled" => patch.health_score_enabled = value.parse().ok(),
        "health_window_minutes" => patch.health_window_minutes = value.parse().ok(),
        "health_update_interval_seconds" => patch.health_update_interval_seconds = value.parse().ok(),
        "cooldown_ceiling_secs" => patch.cooldown_ceiling_secs = value.parse().ok(),
        _ => {}
    }
}

pub async fn persist_patch(store: &dyn Store, patch: &GlobalConfigPatch) -> anyhow::Result<()> {
    let mut entries = Vec::new();
    macro_rules! put {
        ($field:ident) => {
            if let Some(v) = &patch.$field {
                entries.push((format!("{SETTINGS_PREFIX}{}", stringify!($field)), v.to_string()));
            }
        };
        ($field:ident, join) => {
            if let Some(v) = &patch.$field {
                entries.push((format!("{SETTINGS_PREFIX}{}", stringify!($field)), v.join(",")));
            }
        };
    }
    put!(host);
    put!(port);
    put!(admin_pass_hash);
    put!(auth_tokens, join);
    put!(dsn);
    put!(proxy);
    put!(skip_tls_verify);
    put!(max_key_retries);
    put!(first_byte_timeout_secs);
    put!(max_concurrency);
    put!(shutdown_timeout_secs);
    put!(log_buffer);
    put!(log_workers);
    put!(log_retention_days);
    put!(model_lookup_strip_date_suffix);
    put!(model_fuzzy_match);
    put!(health_score_enabled);
    put!(health_window_minutes);
    put!(health_update_interval_seconds);
    put!(cooldown_ceiling_secs);
    store.batch_update_settings(&entries).await.context("persist global config")?;
    Ok(())
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() || (trimmed.starts_with("${") && trimmed.ends_with('}')) {
        return None;
    }
    Some(trimmed)
}

fn sanitize_dsn_value(value: Option<String>) -> String {
    sanitize_optional_env_value(value).unwrap_or_else(default_dsn)
}

fn default_dsn() -> String {
    if let Some(data_dir) = sanitize_optional_env_value(std::env::var("CCLOAD_DATA_DIR").ok()) {
        let dir = data_dir.trim_end_matches('/');
        return format!("sqlite://{dir}/ccload.db?mode=rwc");
    }
    "sqlite://ccload.db?mode=rwc".to_string()
}

fn ensure_sqlite_parent_dir(dsn: &str) -> anyhow::Result<()> {
    let Some(db_path) = sqlite_file_path_from_dsn(dsn) else {
        return Ok(());
    };
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create sqlite parent dir {}", parent.display()))?;
    Ok(())
}

fn sqlite_file_path_from_dsn(dsn: &str) -> Option<PathBuf> {
    let rest = dsn.strip_prefix("sqlite:")?;
    let path_part = rest.split(['?', '#']).next()?.trim();
    if path_part.is_empty() {
        return None;
    }
    let mut normalized = path_part;
    if let Some(stripped) = normalized.strip_prefix("//") {
        normalized = stripped;
    }
    if normalized.to_ascii_lowercase() == ":memory:" {
        return None;
    }
    Some(PathBuf::from(normalized))
}

fn parse_u16_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    parse_env_value(value, env_name)
}
fn parse_u32_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u32>> {
    parse_env_value(value, env_name)
}
fn parse_u64_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u64>> {
    parse_env_value(value, env_name)
}
fn parse_usize_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<usize>> {
    parse_env_value(value, env_name)
}
fn parse_i64_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<i64>> {
    parse_env_value(value, env_name)
}

fn parse_env_value<T: std::str::FromStr>(value: Option<String>, env_name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|err| anyhow::anyhow!("invalid {env_name} value {raw}: {err}"))
}

fn parse_bool_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(anyhow::anyhow!("invalid {env_name} value: {raw}")),
    }
}

pub fn hash_admin_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

pub fn generate_admin_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_dsn_resolves_relative_path() {
        let path = sqlite_file_path_from_dsn("sqlite://ccload.db?mode=rwc").unwrap();
        assert_eq!(path.to_string_lossy(), "ccload.db");
    }

    #[test]
    fn sqlite_dsn_resolves_absolute_path() {
        let path = sqlite_file_path_from_dsn("sqlite://app/data/ccload.db?mode=rwc").unwrap();
        assert_eq!(path.to_string_lossy(), "/app/data/ccload.db");
    }

    #[test]
    fn sqlite_memory_dsn_is_ignored() {
        assert!(sqlite_file_path_from_dsn("sqlite::memory:").is_none());
        assert!(sqlite_file_path_from_dsn("sqlite://:memory:").is_none());
    }

    #[test]
    fn settings_roundtrip_through_patch() {
        let mut patch = GlobalConfigPatch::default();
        apply_setting(&mut patch, "port", "9090");
        apply_setting(&mut patch, "auth_tokens", "a,b,c");
        assert_eq!(patch.port, Some(9090));
        assert_eq!(patch.auth_tokens, Some(vec!["a".into(), "b".into(), "c".into()]));
    }
}
