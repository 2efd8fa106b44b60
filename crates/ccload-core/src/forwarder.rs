//! One-shot upstream call (spec §4.4): URL/auth construction, optional
//! body model rewrite, first-byte timeout, and streaming/buffered body
//! copy with usage extraction teed in.

use bytes::{Bytes, BytesMut};
use ccload_common::ChannelType;
use ccload_storage::types::Channel;
use ccload_usage::UsageParser;
use http::HeaderMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{ErrorKind, STATUS_CLIENT_CLOSED, STATUS_FIRST_BYTE_TIMEOUT, classify_status};
use crate::request_context::{FirstByteOutcome, RequestContext};
use crate::upstream_client::UpstreamClient;

const NON_STREAM_USAGE_CAP: usize = 1024 * 1024;

pub struct ForwardRequest<'a> {
    pub channel: &'a Channel,
    pub secret: &'a str,
    pub method: http::Method,
    pub path: &'a str,
    pub headers_in: &'a HeaderMap,
    pub body_in: Bytes,
    pub effective_model: Option<&'a str>,
    pub proxy: Option<&'a str>,
    pub skip_tls_verify: bool,
}

pub enum ForwardBody {
    Buffered(Bytes),
    Streaming {
        rx: tokio::sync::mpsc::Receiver<Bytes>,
        summary: oneshot::Receiver<StreamSummary>,
    },
}

pub struct StreamSummary {
    pub usage: ccload_usage::UsageSnapshot,
    pub last_error: Option<Vec<u8>>,
    /// Set when the streaming copy stopped because the inbound call was
    /// cancelled rather than the upstream stream ending on its own
    /// (spec §4.5: client disconnect logs status 499, no cooldown).
    pub client_cancelled: bool,
}

pub struct ForwardOutcome {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ForwardBody,
    pub usage: ccload_usage::UsageSnapshot,
    pub last_error: Option<Vec<u8>>,
    pub first_byte_ms: i64,
    pub error_kind: Option<ErrorKind>,
}

pub struct Forwarder {
    client: UpstreamClient,
}

impl Forwarder {
    pub fn new() -> Self {
        Self {
            client: UpstreamClient::new(),
        }
    }

    pub async fn forward(
        &self,
        req: ForwardRequest<'_>,
        ctx: &RequestContext,
    ) -> ForwardOutcome {
        let url = build_url(&req.channel.url, req.path);
        let headers = build_headers(req.headers_in, req.channel.channel_type, req.secret);
        let body = rewrite_model(req.body_in, req.effective_model);

        let send_fut = self.client.send(
            req.method,
            &url,
            &headers,
            Some(body),
            req.proxy,
            req.skip_tls_verify,
        );

        let response = match ctx.race_first_byte(send_fut).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(event = "forward_transport_error", error = %err, channel_id = req.channel.id);
                return ForwardOutcome {
                    status: 0,
                    headers: Vec::new(),
                    body: ForwardBody::Buffered(Bytes::new()),
                    usage: ccload_usage::UsageSnapshot::default(),
                    last_error: Some(err.to_string().into_bytes()),
                    first_byte_ms: ctx.elapsed_ms(),
                    error_kind: Some(ErrorKind::UpstreamServer),
                };
            }
            Err(FirstByteOutcome::TimedOut) => {
                warn!(event = "forward_first_byte_timeout", channel_id = req.channel.id);
                return ForwardOutcome {
                    status: STATUS_FIRST_BYTE_TIMEOUT,
                    headers: Vec::new(),
                    body: ForwardBody::Buffered(Bytes::new()),
                    usage: ccload_usage::UsageSnapshot::default(),
                    last_error: Some(b"first byte timeout".to_vec()),
                    first_byte_ms: ctx.elapsed_ms(),
                    error_kind: Some(ErrorKind::UpstreamServer),
                };
            }
            Err(FirstByteOutcome::Cancelled) => {
                debug!(event = "forward_client_cancelled", channel_id = req.channel.id);
                return ForwardOutcome {
                    status: STATUS_CLIENT_CLOSED,
                    headers: Vec::new(),
                    body: ForwardBody::Buffered(Bytes::new()),
                    usage: ccload_usage::UsageSnapshot::default(),
                    last_error: None,
                    first_byte_ms: ctx.elapsed_ms(),
                    error_kind: Some(ErrorKind::ClientCancel),
                };
            }
        };

        let first_byte_ms = ctx.elapsed_ms();
        let is_success = (200..300).contains(&response.status);
        let channel_type = req.channel.channel_type;

        if !is_success {
            let (body, _usage) =
                drain_buffered(response.body_stream, channel_type, false).await;
            return ForwardOutcome {
                error_kind: classify_status(response.status),
                status: response.status,
                headers: response.headers,
                usage: ccload_usage::UsageSnapshot::default(),
                last_error: Some(body.to_vec()),
                body: ForwardBody::Buffered(body),
                first_byte_ms,
            };
        }

        if ctx.is_stream {
            let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
            let (summary_tx, summary_rx) = oneshot::channel();
            let cancellation = ctx.cancellation.clone();
            let mut upstream_rx = response.body_stream;
            tokio::spawn(async move {
                let mut parser = UsageParser::new(channel_type, true);
                let mut client_cancelled = false;
                loop {
                    tokio::select! {
                        biased;
                        _ = cancellation.cancelled() => {
                            debug!(event = "stream_client_cancel");
                            client_cancelled = true;
                            break;
                        }
                        chunk = upstream_rx.recv() => {
                            let Some(chunk) = chunk else { break };
                            if let Ok(text) = std::str::from_utf8(&chunk) {
                                parser.feed(text.as_bytes());
                            }
                            if tx.send(chunk).await.is_err() {
                                client_cancelled = true;
                                break;
                            }
                        }
                    }
                }
                // Dropping `upstream_rx` here (end of scope) closes the
                // upstream body; combined with `cancellation` this is
                // what unblocks the upstream read within the ≤500ms
                // bound required by spec §5.
                parser.finish();
                let _ = summary_tx.send(StreamSummary {
                    usage: parser.usage(),
                    last_error: parser.last_error().map(<[u8]>::to_vec),
                    client_cancelled,
                });
            });
            return ForwardOutcome {
                status: response.status,
                headers: response.headers,
                body: ForwardBody::Streaming {
                    rx,
                    summary: summary_rx,
                },
                usage: ccload_usage::UsageSnapshot::default(),
                last_error: None,
                first_byte_ms,
                error_kind: None,
            };
        }

        let (body, usage) = drain_buffered(response.body_stream, channel_type, true).await;
        ForwardOutcome {
            status: response.status,
            headers: response.headers,
            usage,
            last_error: None,
            body: ForwardBody::Buffered(body),
            first_byte_ms,
        }
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain_buffered(
    mut rx: tokio::sync::mpsc::Receiver<Bytes>,
    channel_type: ChannelType,
    extract_usage: bool,
) -> (Bytes, ccload_usage::UsageSnapshot) {
    let mut buf = BytesMut::new();
    let mut parser = extract_usage.then(|| UsageParser::new(channel_type, false));
    while let Some(chunk) = rx.recv().await {
        if let Some(parser) = parser.as_mut() {
            if buf.len() + chunk.len() <= NON_STREAM_USAGE_CAP {
                parser.feed(&chunk);
            }
        }
        buf.extend_from_slice(&chunk);
    }
    if let Some(parser) = parser.as_mut() {
        parser.finish();
    }
    let usage = parser.map(|p| p.usage()).unwrap_or_default();
    (buf.freeze(), usage)
}

fn build_url(channel_url: &str, path: &str) -> String {
    format!("{}{path}", channel_url.trim_end_matches('/'))
}

fn build_headers(headers_in: &HeaderMap, channel_type: ChannelType, secret: &str) -> Vec<(String, String)> {
    let strip = ["authorization", "x-api-key", "x-goog-api-key", "host", "content-length"];
    let mut out: Vec<(String, String)> = headers_in
        .iter()
        .filter(|(name, _)| !strip.contains(&name.as_str().to_ascii_lowercase().as_str()))
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect();

    match channel_type {
        ChannelType::Anthropic => out.push(("x-api-key".to_string(), secret.to_string())),
        ChannelType::Openai | ChannelType::Codex => {
            out.push(("authorization".to_string(), format!("Bearer {secret}")))
        }
        ChannelType::Gemini => out.push(("x-goog-api-key".to_string(), secret.to_string())),
    }
    out
}

/// Rewrites the JSON body's `model` field when the selector resolved a
/// different effective upstream name. Rewrite failure is non-fatal
/// (spec §4.4): the original body is forwarded unchanged.
fn rewrite_model(body: Bytes, effective_model: Option<&str>) -> Bytes {
    let Some(effective_model) = effective_model else {
        return body;
    };
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return body;
    };
    let Some(obj) = value.as_object_mut() else {
        return body;
    };
    let needs_rewrite = obj
        .get("model")
        .and_then(|m| m.as_str())
        .is_some_and(|m| m != effective_model);
    if !needs_rewrite {
        return body;
    }
    obj.insert("model".to_string(), serde_json::Value::String(effective_model.to_string()));
    match serde_json::to_vec(&value) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_model_replaces_differing_name() {
        let body = Bytes::from_static(br#"{"model":"claude-3-5-sonnet-20241022","stream":true}"#);
        let out = rewrite_model(body, Some("claude-3-5-sonnet"));
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["model"], "claude-3-5-sonnet");
        assert_eq!(value["stream"], true);
    }

    #[test]
    fn rewrite_model_is_noop_when_names_match() {
        let body = Bytes::from_static(br#"{"model":"claude-3-5-sonnet"}"#);
        let out = rewrite_model(body.clone(), Some("claude-3-5-sonnet"));
        assert_eq!(out, body);
    }

    #[test]
    fn rewrite_model_falls_back_to_original_on_malformed_json() {
        let body = Bytes::from_static(b"not json");
        let out = rewrite_model(body.clone(), Some("x"));
        assert_eq!(out, body);
    }

    #[test]
    fn build_headers_strips_inbound_auth_and_attaches_channel_credential() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer wrong".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());
        let out = build_headers(&headers, ChannelType::Anthropic, "sk-real");
        assert!(out.iter().any(|(k, v)| k == "x-api-key" && v == "sk-real"));
        assert!(!out.iter().any(|(k, _)| k == "authorization"));
        assert!(out.iter().any(|(k, _)| k == "content-type"));
    }

    #[test]
    fn build_url_strips_trailing_slash() {
        assert_eq!(build_url("https://api.example.com/", "/v1/messages"), "https://api.example.com/v1/messages");
    }
}
