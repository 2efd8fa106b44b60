//! Inbound HTTP entry point (spec §6): dispatches to a local responder
//! for `count_tokens`/`models`, otherwise drives the retry orchestrator
//! and streams (or buffers) the result back to the caller.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use ccload_storage::types::LogEntry;
use futures_util::StreamExt;
use serde_json::json;
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::auth::resolve_caller_identity;
use crate::classify::{Route, classify};
use crate::error::{ProxyError, external_status};
use crate::forwarder::ForwardBody;
use crate::request_context::RequestContext;
use crate::retry::RetryInput;
use crate::state::AppState;

pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: axum::http::Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path();
    let route = match classify(&method, path) {
        Ok(route) => route,
        Err(err) => return err.into_response(),
    };

    match route {
        Route::CountTokens => count_tokens(&body).into_response(),
        Route::ListModels { is_claude_family } => list_models(&state, is_claude_family).into_response(),
        Route::Forward { path, .. } => forward(state, method, path, headers, uri.query(), body).await,
    }
}

fn count_tokens(body: &Bytes) -> Response {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return ProxyError::bad_request("invalid request body").into_response();
    };
    let estimated = estimate_input_tokens(&value);
    (StatusCode::OK, axum::Json(json!({ "input_tokens": estimated }))).into_response()
}

/// Rough character-count heuristic (~4 chars/token); good enough for a
/// pre-flight estimate, not meant to match the upstream tokenizer exactly.
fn estimate_input_tokens(value: &serde_json::Value) -> i64 {
    let mut chars: i64 = 0;
    if let Some(system) = value.get("system") {
        chars += json_text_len(system);
    }
    if let Some(messages) = value.get("messages").and_then(|m| m.as_array()) {
        for message in messages {
            if let Some(content) = message.get("content") {
                chars += json_text_len(content);
            }
        }
    }
    (chars / 4).max(1)
}

fn json_text_len(value: &serde_json::Value) -> i64 {
    match value {
        serde_json::Value::String(s) => s.chars().count() as i64,
        serde_json::Value::Array(items) => items.iter().map(json_text_len).sum(),
        serde_json::Value::Object(obj) => obj.values().map(json_text_len).sum(),
        _ => 0,
    }
}

fn list_models(state: &AppState, is_claude_family: bool) -> Response {
    let channel_type = if is_claude_family {
        ccload_common::ChannelType::Anthropic
    } else {
        ccload_common::ChannelType::Gemini
    };
    let mut names: Vec<String> = state
        .channels
        .all()
        .iter()
        .filter(|c| c.enabled && c.channel_type == channel_type)
        .flat_map(|c| c.models.iter().map(|m| m.name.clone()))
        .collect();
    names.sort_unstable();
    names.dedup();

    if is_claude_family {
        let data: Vec<_> = names
            .into_iter()
            .map(|id| json!({ "id": id, "object": "model" }))
            .collect();
        axum::Json(json!({ "object": "list", "data": data })).into_response()
    } else {
        let models: Vec<_> = names
            .into_iter()
            .map(|name| json!({ "name": name }))
            .collect();
        axum::Json(json!({ "models": models })).into_response()
    }
}

async fn forward(
    state: Arc<AppState>,
    method: Method,
    path: String,
    headers: HeaderMap,
    query: Option<&str>,
    body: Bytes,
) -> Response {
    let config = state.config();
    let caller = resolve_caller_identity(&headers, query);
    let model = extract_model(&body);
    let is_stream = request_wants_stream(&body, &path);

    // spec §5: bound the number of concurrently active forwards to
    // `global.max_concurrency`; a saturated semaphore makes new
    // requests wait here rather than admitting them unbounded.
    let Ok(concurrency_permit) = state.concurrency.clone().acquire_owned().await else {
        return ProxyError::Internal("server shutting down".to_string()).into_response();
    };

    let ctx = RequestContext::new(
        caller.clone(),
        model.clone(),
        is_stream,
        Duration::from_secs(config.first_byte_timeout_secs),
    );

    let (request_id, _guard) = state
        .registry
        .clone()
        .register(model.clone(), caller.token_id.clone(), ctx.cancellation.clone());

    let Some(model_for_select) = model.as_deref() else {
        return ProxyError::bad_request("missing model field").into_response();
    };

    let retry_outcome = state
        .retry
        .run(
            RetryInput {
                model: model_for_select,
                method: method.clone(),
                path: &path,
                headers_in: &headers,
                body_in: body,
                proxy: config.proxy.as_deref(),
                skip_tls_verify: config.skip_tls_verify,
                strip_date_suffix: config.model_lookup_strip_date_suffix,
                fuzzy_match: config.model_fuzzy_match,
                health_score_enabled: config.health_score_enabled,
                max_key_retries: config.max_key_retries,
            },
            &ctx,
        )
        .await;

    if let Some(channel_id) = retry_outcome.channel_id {
        state.registry.set_channel(&request_id, channel_id);
    }

    let outcome = retry_outcome.outcome;
    let external = external_status(outcome.status);
    let duration_ms = ctx.elapsed_ms();

    match outcome.body {
        ForwardBody::Buffered(bytes) => {
            log_request(&state, &ctx, &caller, retry_outcome.channel_id, external.as_u16() as i32, duration_ms, outcome.first_byte_ms, outcome.usage, outcome.last_error);
            let mut response = Response::builder().status(external);
            for (name, value) in &outcome.headers {
                response = response.header(name.as_str(), value.as_str());
            }
            response.body(Body::from(bytes)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        ForwardBody::Streaming { rx, summary } => {
            let state = state.clone();
            let caller = caller.clone();
            let channel_id = retry_outcome.channel_id;
            let first_byte_ms = outcome.first_byte_ms;
            tokio::spawn(async move {
                let _guard = _guard;
                let _concurrency_permit = concurrency_permit;
                if let Ok(stream_summary) = summary.await {
                    // spec §4.4/§4.5/§7 (UpstreamProtocolError): an SSE
                    // `event: error` inside an otherwise-200 stream is
                    // the terminal outcome even though headers already
                    // carried 200; treated like an UpstreamServer
                    // failure for logging and channel cooldown, though
                    // by now bytes are already on the wire so there's
                    // no retry to perform.
                    let has_protocol_error = !stream_summary.client_cancelled && stream_summary.last_error.is_some();
                    let status = if stream_summary.client_cancelled {
                        crate::error::STATUS_CLIENT_CLOSED as i32
                    } else if has_protocol_error {
                        StatusCode::BAD_GATEWAY.as_u16() as i32
                    } else {
                        external.as_u16() as i32
                    };
                    if has_protocol_error {
                        if let Some(channel_id) = channel_id {
                            state.cooldowns.bump_channel(channel_id, crate::retry::SERVER_COOLDOWN).await;
                        }
                    }
                    log_request(
                        &state,
                        &ctx,
                        &caller,
                        channel_id,
                        status,
                        duration_ms,
                        first_byte_ms,
                        stream_summary.usage,
                        stream_summary.last_error,
                    );
                }
            });
            let mut response = Response::builder().status(external);
            for (name, value) in &outcome.headers {
                response = response.header(name.as_str(), value.as_str());
            }
            response
                .body(Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, std::io::Error>)))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

fn extract_model(body: &Bytes) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(str::to_string))
}

fn request_wants_stream(body: &Bytes, path: &str) -> bool {
    if path.contains(":streamGenerateContent") || path.ends_with("/stream") {
        return true;
    }
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false)
}

#[allow(clippy::too_many_arguments)]
fn log_request(
    state: &AppState,
    ctx: &RequestContext,
    caller: &crate::auth::CallerIdentity,
    channel_id: Option<ccload_common::ChannelId>,
    status: i32,
    duration_ms: i64,
    first_byte_ms: i64,
    usage: ccload_usage::UsageSnapshot,
    last_error: Option<Vec<u8>>,
) {
    let message = last_error.map(|b| String::from_utf8_lossy(&b).chars().take(500).collect());
    info!(event = "request_complete", status, channel_id, duration_ms, model = ctx.model.as_deref());
    let entry = LogEntry {
        at: OffsetDateTime::now_utc(),
        channel_id,
        model: ctx.model.clone(),
        caller_token_hash: caller.token_hash.clone(),
        caller_token_id: caller.token_id.clone(),
        status,
        duration_ms,
        first_byte_ms: Some(first_byte_ms),
        is_stream: ctx.is_stream,
        message,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_input_tokens: usage.cache_read_input_tokens,
        cache_creation_input_tokens: usage.cache_creation_input_tokens,
        cost_usd: 0.0,
    };
    state.telemetry.offer(entry);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_input_tokens_counts_system_and_messages() {
        let value = json!({
            "system": "you are helpful",
            "messages": [{"role": "user", "content": "hello there"}]
        });
        let estimate = estimate_input_tokens(&value);
        assert!(estimate > 0);
    }

    #[test]
    fn request_wants_stream_detects_json_flag() {
        let body = Bytes::from_static(br#"{"model":"x","stream":true}"#);
        assert!(request_wants_stream(&body, "/v1/messages"));
    }

    #[test]
    fn request_wants_stream_detects_gemini_path_suffix() {
        let body = Bytes::from_static(b"{}");
        assert!(request_wants_stream(&body, "/v1beta/models/gemini-pro:streamGenerateContent"));
    }
}
