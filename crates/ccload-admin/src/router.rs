//! Admin CRUD HTTP surface (spec §6, explicitly out of core scope):
//! channel/key management, settings, cooldown clearing, usage/log
//! queries, and CSV import/export. Grounded on the teacher's admin
//! router shape (key extraction, auth middleware, JSON responses)
//! but scoped to this project's channel/key model.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use ccload_core::AppState;
use ccload_storage::{Store, StorageError};
use ccload_storage::types::NewChannel;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::csv_io;

#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
    /// Flips to request a graceful shutdown; settings changes trigger
    /// a restart rather than an in-place hot reload (see DESIGN.md).
    pub shutdown: watch::Sender<bool>,
}

pub fn router(app: Arc<AppState>, shutdown: watch::Sender<bool>) -> Router {
    let state = AdminState { app, shutdown };

    Router::new()
        .route("/health", get(health))
        .route("/global", get(get_global).put(put_global))
        .route("/channels", get(list_channels).post(create_channel))
        .route("/channels/export", get(export_channels))
        .route("/channels/import", post(import_channels))
        .route("/channels/success_rates", get(success_rates))
        .route(
            "/channels/{id}",
            get(get_channel).put(update_channel).delete(delete_channel),
        )
        .route("/channels/{id}/keys", get(list_keys).post(add_keys))
        .route("/channels/{id}/cooldown", axum::routing::delete(clear_channel_cooldown))
        .route(
            "/channels/{id}/keys/{key_index}/cooldown",
            axum::routing::delete(clear_key_cooldown),
        )
        .route("/models/distinct", get(distinct_models))
        .route("/logs", get(query_logs))
        .route("/usage", get(query_usage))
        .route("/requests", get(active_requests))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<AdminState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let key = extract_admin_key(&headers, req.uri()).ok_or(StatusCode::UNAUTHORIZED)?;
    let expected = state.app.config().admin_pass_hash.clone();
    if ccload_core::hash_admin_key(&key) != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn extract_admin_key(headers: &HeaderMap, uri: &axum::http::Uri) -> Option<String> {
    if let Some(value) = headers.get("x-admin-key")
        && let Ok(s) = value.to_str()
    {
        let s = s.trim();
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(auth) = value.to_str()
    {
        let auth = auth.trim();
        let prefix = "Bearer ";
        if auth.len() > prefix.len() && auth[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = auth[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    let query = uri.query()?;
    let parsed: HashMap<String, String> = serde_urlencoded::from_str(query).ok()?;
    let key = parsed.get("admin_key")?.trim();
    if key.is_empty() { None } else { Some(key.to_string()) }
}

fn storage_error(err: StorageError) -> Response {
    let status = match &err {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::InvalidChannelType(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    match state.app.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn get_global(State(state): State<AdminState>) -> impl IntoResponse {
    let global = state.app.config();
    Json(serde_json::json!({
        "host": global.host,
        "port": global.port,
        "auth_tokens_count": global.auth_tokens.len(),
        "dsn": global.dsn,
        "proxy": global.proxy,
        "skip_tls_verify": global.skip_tls_verify,
        "max_key_retries": global.max_key_retries,
        "first_byte_timeout_secs": global.first_byte_timeout_secs,
        "max_concurrency": global.max_concurrency,
        "shutdown_timeout_secs": global.shutdown_timeout_secs,
        "log_buffer": global.log_buffer,
        "log_workers": global.log_workers,
        "log_retention_days": global.log_retention_days,
        "model_lookup_strip_date_suffix": global.model_lookup_strip_date_suffix,
        "model_fuzzy_match": global.model_fuzzy_match,
        "health_score_enabled": global.health_score_enabled,
        "health_window_minutes": global.health_window_minutes,
        "health_update_interval_seconds": global.health_update_interval_seconds,
        "cooldown_ceiling_secs": global.cooldown_ceiling_secs,
    }))
}

#[derive(Debug, Deserialize)]
struct PutGlobalBody {
    host: Option<String>,
    port: Option<u16>,
    admin_pass: Option<String>,
    auth_tokens: Option<Vec<String>>,
    proxy: Option<String>,
    skip_tls_verify: Option<bool>,
    max_key_retries: Option<u32>,
    first_byte_timeout_secs: Option<u64>,
    max_concurrency: Option<usize>,
    log_retention_days: Option<i64>,
    model_lookup_strip_date_suffix: Option<bool>,
    model_fuzzy_match: Option<bool>,
    health_score_enabled: Option<bool>,
    health_window_minutes: Option<i64>,
    health_update_interval_seconds: Option<u64>,
    cooldown_ceiling_secs: Option<u64>,
}

/// Persists the patch and requests a graceful restart; the process
/// never hot-applies a settings change in place (see DESIGN.md).
async fn put_global(State(state): State<AdminState>, Json(body): Json<PutGlobalBody>) -> impl IntoResponse {
    let patch = ccload_common::GlobalConfigPatch {
        host: body.host,
        port: body.port,
        admin_pass_hash: body.admin_pass.as_deref().map(ccload_core::hash_admin_key),
        auth_tokens: body.auth_tokens,
        dsn: None,
        proxy: body.proxy,
        skip_tls_verify: body.skip_tls_verify,
        max_key_retries: body.max_key_retries,
        first_byte_timeout_secs: body.first_byte_timeout_secs,
        max_concurrency: body.max_concurrency,
        shutdown_timeout_secs: None,
        log_buffer: None,
        log_workers: None,
        log_retention_days: body.log_retention_days,
        model_lookup_strip_date_suffix: body.model_lookup_strip_date_suffix,
        model_fuzzy_match: body.model_fuzzy_match,
        health_score_enabled: body.health_score_enabled,
        health_window_minutes: body.health_window_minutes,
        health_update_interval_seconds: body.health_update_interval_seconds,
        cooldown_ceiling_secs: body.cooldown_ceiling_secs,
    };
    if let Err(err) = ccload_core::persist_patch(state.app.store.as_ref(), &patch).await {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": err.to_string() })))
            .into_response();
    }
    let _ = state.shutdown.send(true);
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "ok": true, "restart_required": true }))).into_response()
}

async fn list_channels(State(state): State<AdminState>) -> impl IntoResponse {
    match state.app.store.list_configs().await {
        Ok(channels) => Json(serde_json::json!({ "channels": channels_json(&channels) })).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn get_channel(State(state): State<AdminState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.app.store.get_config(id).await {
        Ok(Some(channel)) => Json(channel_json(&channel)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "channel_not_found" }))).into_response(),
        Err(err) => storage_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct ChannelBody {
    name: String,
    url: String,
    channel_type: String,
    priority: i32,
    enabled: bool,
    models: Vec<String>,
    #[serde(default)]
    model_redirects: HashMap<String, String>,
    key_strategy: String,
    api_keys: Vec<String>,
}

fn body_to_new_channel(body: ChannelBody) -> anyhow::Result<NewChannel> {
    let channel_type = body.channel_type.parse().map_err(|_| anyhow::anyhow!("unknown channel_type"))?;
    let key_strategy = body.key_strategy.parse().map_err(|_| anyhow::anyhow!("unknown key_strategy"))?;
    let models = body
        .models
        .into_iter()
        .map(|name| {
            let redirect = body.model_redirects.get(&name).cloned();
            ccload_storage::types::ModelEntry { name, redirect }
        })
        .collect();
    Ok(NewChannel {
        name: body.name,
        url: body.url,
        channel_type,
        priority: body.priority,
        enabled: body.enabled,
        models,
        key_strategy,
        api_keys: body.api_keys,
    })
}

async fn create_channel(State(state): State<AdminState>, Json(body): Json<ChannelBody>) -> impl IntoResponse {
    let new_channel = match body_to_new_channel(body) {
        Ok(c) => c,
        Err(err) => return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": err.to_string() }))).into_response(),
    };
    match state.app.store.create_config(new_channel).await {
        Ok(id) => {
            let _ = state.app.refresh_channels().await;
            (StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn update_channel(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(body): Json<ChannelBody>,
) -> impl IntoResponse {
    let new_channel = match body_to_new_channel(body) {
        Ok(c) => c,
        Err(err) => return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": err.to_string() }))).into_response(),
    };
    match state.app.store.update_config(id, new_channel).await {
        Ok(()) => {
            let _ = state.app.refresh_channels().await;
            (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn delete_channel(State(state): State<AdminState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.app.store.delete_config(id).await {
        Ok(()) => {
            state.app.cooldowns.remove_channel(id).await;
            let _ = state.app.refresh_channels().await;
            (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn list_keys(State(state): State<AdminState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.app.store.get_api_keys(id).await {
        Ok(keys) => {
            let redacted: Vec<_> = keys.iter().map(|k| serde_json::json!({ "key_index": k.key_index, "secret": redact(&k.secret) })).collect();
            Json(serde_json::json!({ "keys": redacted })).into_response()
        }
        Err(err) => storage_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct AddKeysBody {
    secrets: Vec<String>,
}

async fn add_keys(State(state): State<AdminState>, Path(id): Path<i64>, Json(body): Json<AddKeysBody>) -> impl IntoResponse {
    match state.app.store.create_api_keys_batch(id, &body.secrets).await {
        Ok(()) => {
            let _ = state.app.refresh_channels().await;
            (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn clear_channel_cooldown(State(state): State<AdminState>, Path(id): Path<i64>) -> impl IntoResponse {
    state.app.cooldowns.clear_channel(id).await;
    (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
}

async fn clear_key_cooldown(
    State(state): State<AdminState>,
    Path((id, key_index)): Path<(i64, u32)>,
) -> impl IntoResponse {
    state.app.cooldowns.clear_key(id, key_index).await;
    (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
}

async fn distinct_models(State(state): State<AdminState>) -> impl IntoResponse {
    match state.app.store.get_distinct_models().await {
        Ok(models) => Json(serde_json::json!({ "models": models })).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn success_rates(State(state): State<AdminState>, Query(q): Query<SinceQuery>) -> impl IntoResponse {
    let since = OffsetDateTime::now_utc() - time::Duration::minutes(q.since_minutes.unwrap_or(60));
    match state.app.store.get_channel_success_rates(since).await {
        Ok(rates) => {
            let data: Vec<_> = rates
                .into_iter()
                .map(|r| serde_json::json!({ "channel_id": r.channel_id, "success_rate": r.success_rate, "sample_count": r.sample_count }))
                .collect();
            Json(serde_json::json!({ "rates": data })).into_response()
        }
        Err(err) => storage_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct SinceQuery {
    since_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    from: Option<String>,
    to: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    channel_id: Option<i64>,
    model: Option<String>,
}

fn parse_range(q: &RangeQuery) -> (OffsetDateTime, OffsetDateTime) {
    let now = OffsetDateTime::now_utc();
    let from = q
        .from
        .as_deref()
        .and_then(|s| OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339).ok())
        .unwrap_or(now - time::Duration::days(1));
    let to = q
        .to
        .as_deref()
        .and_then(|s| OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339).ok())
        .unwrap_or(now);
    (from, to)
}

async fn query_logs(State(state): State<AdminState>, Query(q): Query<RangeQuery>) -> impl IntoResponse {
    let (from, to) = parse_range(&q);
    let limit = q.limit.unwrap_or(100).min(1000);
    let offset = q.offset.unwrap_or(0);
    match state.app.store.list_logs_range(from, to, limit, offset).await {
        Ok(entries) => {
            let total = state.app.store.count_logs_range(from, to).await.unwrap_or(0);
            Json(serde_json::json!({ "total": total, "entries": log_entries_json(&entries) })).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn query_usage(State(state): State<AdminState>, Query(q): Query<RangeQuery>) -> impl IntoResponse {
    let (from, to) = parse_range(&q);
    let filter = ccload_storage::UsageAggregateFilter { from, to, channel_id: q.channel_id, model: q.model.clone() };
    match state.app.store.aggregate(filter).await {
        Ok(agg) => Json(serde_json::json!({
            "matched_rows": agg.matched_rows,
            "input_tokens": agg.input_tokens,
            "output_tokens": agg.output_tokens,
            "cache_read_input_tokens": agg.cache_read_input_tokens,
            "cache_creation_input_tokens": agg.cache_creation_input_tokens,
            "total_cost_usd": agg.total_cost_usd,
        }))
        .into_response(),
        Err(err) => storage_error(err),
    }
}

async fn active_requests(State(state): State<AdminState>) -> impl IntoResponse {
    let entries = state.app.registry.snapshot();
    let data: Vec<_> = entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "request_id": e.request_id,
                "channel_id": e.channel_id,
                "model": e.model,
                "started_at": e.started_at.unix_timestamp(),
                "caller_token_id": e.caller_token_id,
            })
        })
        .collect();
    Json(serde_json::json!({ "requests": data }))
}

async fn export_channels(State(state): State<AdminState>) -> impl IntoResponse {
    let channels = match state.app.store.list_configs().await {
        Ok(c) => c,
        Err(err) => return storage_error(err),
    };
    let mut rows = Vec::with_capacity(channels.len());
    for channel in channels {
        let keys = match state.app.store.get_api_keys(channel.id).await {
            Ok(k) => k.into_iter().map(|k| k.secret).collect(),
            Err(err) => return storage_error(err),
        };
        rows.push((channel, keys));
    }
    match csv_io::export_channels(&rows) {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            bytes,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": err.to_string() }))).into_response(),
    }
}

async fn import_channels(State(state): State<AdminState>, body: axum::body::Bytes) -> impl IntoResponse {
    let rows = match csv_io::import_channels(&body) {
        Ok(r) => r,
        Err(err) => return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": err.to_string() }))).into_response(),
    };
    let mut imported = 0;
    for row in rows {
        let result = match row.id {
            Some(id) => state.app.store.update_config(id, row.channel).await,
            None => state.app.store.create_config(row.channel).await.map(|_| ()),
        };
        if let Err(err) = result {
            return storage_error(err);
        }
        imported += 1;
    }
    let _ = state.app.refresh_channels().await;
    (StatusCode::OK, Json(serde_json::json!({ "imported": imported }))).into_response()
}

fn redact(secret: &str) -> String {
    if secret.len() <= 8 {
        "*".repeat(secret.len())
    } else {
        format!("{}...{}", &secret[..4], &secret[secret.len() - 4..])
    }
}

fn channel_json(c: &ccload_storage::types::Channel) -> serde_json::Value {
    serde_json::json!({
        "id": c.id,
        "name": c.name,
        "url": c.url,
        "channel_type": c.channel_type.as_str(),
        "priority": c.priority,
        "enabled": c.enabled,
        "models": c.models.iter().map(|m| serde_json::json!({ "name": m.name, "redirect": m.redirect })).collect::<Vec<_>>(),
        "key_strategy": match c.key_strategy {
            ccload_common::KeyStrategy::Sequential => "sequential",
            ccload_common::KeyStrategy::RoundRobin => "round_robin",
        },
        "key_count": c.key_count,
    })
}

fn channels_json(channels: &[ccload_storage::types::Channel]) -> Vec<serde_json::Value> {
    channels.iter().map(channel_json).collect()
}

fn log_entries_json(entries: &[ccload_storage::types::LogEntry]) -> Vec<serde_json::Value> {
    entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "at": e.at.unix_timestamp(),
                "channel_id": e.channel_id,
                "model": e.model,
                "caller_token_id": e.caller_token_id,
                "status": e.status,
                "duration_ms": e.duration_ms,
                "first_byte_ms": e.first_byte_ms,
                "is_stream": e.is_stream,
                "message": e.message,
                "input_tokens": e.input_tokens,
                "output_tokens": e.output_tokens,
                "cache_read_input_tokens": e.cache_read_input_tokens,
                "cache_creation_input_tokens": e.cache_creation_input_tokens,
                "cost_usd": e.cost_usd,
            })
        })
        .collect()
}
