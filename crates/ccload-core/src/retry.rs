//! Forward-and-retry orchestrator (spec §4.1, §4.5): walks the
//! selector's candidate sequence, applying cooldowns and the per-channel
//! key-retry budget, until one candidate succeeds or the candidate
//! budget is exhausted.

use std::sync::Arc;

use bytes::Bytes;
use ccload_common::ChannelId;
use ccload_cooldown::{CooldownManager, exponential_backoff};
use ccload_health::HealthCache;
use ccload_selector::{Candidate, SelectInput, Selector};
use http::HeaderMap;
use time::Duration as TimeDuration;
use tracing::{debug, warn};

use crate::channel_cache::ChannelCache;
use crate::error::{ErrorKind, STATUS_CLIENT_CLOSED, synthesize_exhausted};
use crate::forwarder::{ForwardBody, ForwardOutcome, ForwardRequest, Forwarder};
use crate::request_context::RequestContext;

const MAX_CANDIDATE_BUDGET: usize = 10;
const DEFAULT_MAX_KEY_RETRIES: u32 = 3;
const AUTH_COOLDOWN: TimeDuration = TimeDuration::minutes(30);
pub(crate) const SERVER_COOLDOWN: TimeDuration = TimeDuration::seconds(10);
const DEFAULT_RATE_LIMIT_COOLDOWN: TimeDuration = TimeDuration::seconds(30);
const COOLDOWN_CEILING: TimeDuration = TimeDuration::hours(1);

pub struct RetryInput<'a> {
    pub model: &'a str,
    pub method: http::Method,
    pub path: &'a str,
    pub headers_in: &'a HeaderMap,
    pub body_in: Bytes,
    pub proxy: Option<&'a str>,
    pub skip_tls_verify: bool,
    pub strip_date_suffix: bool,
    pub fuzzy_match: bool,
    pub health_score_enabled: bool,
    pub max_key_retries: u32,
}

pub struct RetryOutcome {
    pub channel_id: Option<ChannelId>,
    pub attempts: u32,
    pub outcome: ForwardOutcome,
}

pub struct RetryOrchestrator {
    channels: Arc<ChannelCache>,
    cooldowns: Arc<CooldownManager>,
    health: Arc<HealthCache>,
    selector: Arc<Selector>,
    forwarder: Arc<Forwarder>,
}

impl RetryOrchestrator {
    pub fn new(
        channels: Arc<ChannelCache>,
        cooldowns: Arc<CooldownManager>,
        health: Arc<HealthCache>,
        selector: Arc<Selector>,
        forwarder: Arc<Forwarder>,
    ) -> Self {
        Self {
            channels,
            cooldowns,
            health,
            selector,
            forwarder,
        }
    }

    pub async fn run(&self, input: RetryInput<'_>, ctx: &RequestContext) -> RetryOutcome {
        let channels = self.channels.all();
        let channel_cooldowns = self.cooldowns.all_channel_cooldowns().await;
        let key_cooldowns = self.cooldowns.all_key_cooldowns().await;

        let select_input = SelectInput {
            model: input.model,
            channels: &channels,
            channel_cooldowns: &channel_cooldowns,
            key_cooldowns: &key_cooldowns,
            health: &self.health,
            strip_date_suffix: input.strip_date_suffix,
            fuzzy_match: input.fuzzy_match,
            health_score_enabled: input.health_score_enabled,
        };
        let candidates = self.selector.select(&select_input);

        if candidates.is_empty() {
            return RetryOutcome {
                channel_id: None,
                attempts: 0,
                outcome: no_channel_outcome(),
            };
        }

        let budget = candidates.len().min(MAX_CANDIDATE_BUDGET);
        let max_key_retries = if input.max_key_retries == 0 {
            DEFAULT_MAX_KEY_RETRIES
        } else {
            input.max_key_retries
        };

        let mut key_attempts_for_channel: u32 = 0;
        let mut current_channel: Option<ChannelId> = None;
        let mut last_outcome: Option<(ChannelId, ForwardOutcome)> = None;
        let mut attempts: u32 = 0;

        for candidate in candidates.into_iter().take(budget) {
            if current_channel != Some(candidate.channel_id) {
                current_channel = Some(candidate.channel_id);
                key_attempts_for_channel = 0;
            }
            if key_attempts_for_channel >= max_key_retries {
                continue;
            }

            let Some(channel) = self.channels.by_id(candidate.channel_id) else {
                continue;
            };
            let Some(secret) = self.channels.secret(candidate.channel_id, candidate.key_index) else {
                continue;
            };

            attempts += 1;
            key_attempts_for_channel += 1;

            let outcome = self
                .forwarder
                .forward(
                    ForwardRequest {
                        channel: &channel,
                        secret: &secret,
                        method: input.method.clone(),
                        path: input.path,
                        headers_in: input.headers_in,
                        body_in: input.body_in.clone(),
                        effective_model: candidate.effective_model.as_deref(),
                        proxy: input.proxy,
                        skip_tls_verify: input.skip_tls_verify,
                    },
                    ctx,
                )
                .await;

            debug!(
                event = "forward_attempt",
                channel_id = candidate.channel_id,
                key_index = candidate.key_index,
                attempt = attempts,
                status = outcome.status,
                first_byte_ms = outcome.first_byte_ms,
            );

            if outcome.error_kind == Some(ErrorKind::ClientCancel) {
                return RetryOutcome {
                    channel_id: Some(candidate.channel_id),
                    attempts,
                    outcome,
                };
            }

            let is_success = (200..300).contains(&outcome.status) || matches!(outcome.body, ForwardBody::Streaming { .. });
            if is_success {
                return RetryOutcome {
                    channel_id: Some(candidate.channel_id),
                    attempts,
                    outcome,
                };
            }

            self.apply_failure_cooldown(&candidate, &outcome, key_attempts_for_channel)
                .await;

            if matches!(
                outcome.error_kind,
                Some(ErrorKind::UpstreamAuth) | Some(ErrorKind::UpstreamRateLimit)
            ) {
                let exhausted = key_attempts_for_channel >= max_key_retries
                    || all_keys_cooled(&self.cooldowns, &channel).await;
                if exhausted {
                    self.cooldowns.bump_channel(candidate.channel_id, SERVER_COOLDOWN).await;
                }
            }

            if outcome.error_kind == Some(ErrorKind::ClientInput) {
                // 4xx that isn't auth/rate-limit: caller's fault, no point retrying another channel.
                return RetryOutcome {
                    channel_id: Some(candidate.channel_id),
                    attempts,
                    outcome,
                };
            }

            last_outcome = Some((candidate.channel_id, outcome));
        }

        match last_outcome {
            Some((channel_id, outcome)) => RetryOutcome {
                channel_id: Some(channel_id),
                attempts,
                outcome,
            },
            None => RetryOutcome {
                channel_id: None,
                attempts,
                outcome: no_channel_outcome(),
            },
        }
    }

    async fn apply_failure_cooldown(
        &self,
        candidate: &Candidate,
        outcome: &ForwardOutcome,
        attempt_no: u32,
    ) {
        let attempt = attempt_no.saturating_sub(1);
        match outcome.error_kind {
            Some(ErrorKind::UpstreamAuth) => {
                let duration = exponential_backoff(AUTH_COOLDOWN, attempt, COOLDOWN_CEILING);
                self.cooldowns
                    .bump_key(candidate.channel_id, candidate.key_index, duration)
                    .await;
            }
            Some(ErrorKind::UpstreamRateLimit) => {
                let duration = retry_after_duration(&outcome.headers)
                    .unwrap_or_else(|| exponential_backoff(DEFAULT_RATE_LIMIT_COOLDOWN, attempt, COOLDOWN_CEILING));
                self.cooldowns
                    .bump_key(candidate.channel_id, candidate.key_index, duration)
                    .await;
            }
            Some(ErrorKind::UpstreamServer) => {
                let duration = exponential_backoff(SERVER_COOLDOWN, attempt, COOLDOWN_CEILING);
                self.cooldowns
                    .bump_channel(candidate.channel_id, duration)
                    .await;
            }
            _ => {}
        }
    }
}

/// Invariant 3 (spec §8): once every key of a channel is cooled, the
/// channel itself must carry a cooldown too, even though its own
/// channel-level cooldown was never directly bumped.
async fn all_keys_cooled(cooldowns: &CooldownManager, channel: &ccload_storage::types::Channel) -> bool {
    if channel.key_count == 0 {
        return false;
    }
    for idx in 0..channel.key_count {
        if !cooldowns.is_key_cooled(channel.id, idx).await {
            return false;
        }
    }
    true
}

fn retry_after_duration(headers: &[(String, String)]) -> Option<TimeDuration> {
    let raw = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("retry-after"))
        .map(|(_, v)| v.as_str())?;
    if let Ok(secs) = raw.trim().parse::<i64>() {
        return Some(TimeDuration::seconds(secs).min(COOLDOWN_CEILING));
    }
    let parsed = time::OffsetDateTime::parse(raw.trim(), &time::format_description::well_known::Rfc2822).ok()?;
    let now = time::OffsetDateTime::now_utc();
    let delta = parsed - now;
    if delta.is_positive() {
        Some(delta.min(COOLDOWN_CEILING))
    } else {
        None
    }
}

fn no_channel_outcome() -> ForwardOutcome {
    let (status, body) = synthesize_exhausted();
    ForwardOutcome {
        status: status.as_u16(),
        headers: Vec::new(),
        body: ForwardBody::Buffered(body),
        usage: ccload_usage::UsageSnapshot::default(),
        last_error: Some(b"no available channel".to_vec()),
        first_byte_ms: 0,
        error_kind: Some(ErrorKind::UpstreamServer),
    }
}

pub fn is_client_closed(status: u16) -> bool {
    status == STATUS_CLIENT_CLOSED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_parses_seconds() {
        let headers = vec![("Retry-After".to_string(), "45".to_string())];
        assert_eq!(retry_after_duration(&headers), Some(TimeDuration::seconds(45)));
    }

    #[test]
    fn retry_after_missing_header_yields_none() {
        let headers = vec![("content-type".to_string(), "application/json".to_string())];
        assert_eq!(retry_after_duration(&headers), None);
    }

    #[test]
    fn retry_after_caps_at_ceiling() {
        let headers = vec![("retry-after".to_string(), "999999".to_string())];
        assert_eq!(retry_after_duration(&headers), Some(COOLDOWN_CEILING));
    }

    fn test_channel(key_count: u32) -> ccload_storage::types::Channel {
        ccload_storage::types::Channel {
            id: 1,
            name: "c1".into(),
            url: "https://api.example.com".into(),
            channel_type: ccload_common::ChannelType::Anthropic,
            priority: 10,
            enabled: true,
            models: vec![ccload_storage::types::ModelEntry {
                name: "claude-3-5-sonnet".into(),
                redirect: None,
            }],
            key_strategy: ccload_common::KeyStrategy::Sequential,
            key_count,
        }
    }

    async fn test_cooldowns() -> CooldownManager {
        let store = ccload_storage::SeaOrmStore::connect("sqlite::memory:").await.unwrap();
        store.sync().await.unwrap();
        CooldownManager::new(Arc::new(store), 3600)
    }

    #[tokio::test]
    async fn all_keys_cooled_false_until_every_key_is_cooled() {
        let cooldowns = test_cooldowns().await;
        let channel = test_channel(2);
        assert!(!all_keys_cooled(&cooldowns, &channel).await);

        cooldowns.bump_key(1, 0, TimeDuration::seconds(60)).await;
        assert!(!all_keys_cooled(&cooldowns, &channel).await);

        cooldowns.bump_key(1, 1, TimeDuration::seconds(60)).await;
        assert!(all_keys_cooled(&cooldowns, &channel).await);
    }

    #[tokio::test]
    async fn all_keys_cooled_false_for_zero_key_channel() {
        let cooldowns = test_cooldowns().await;
        let channel = test_channel(0);
        assert!(!all_keys_cooled(&cooldowns, &channel).await);
    }
}
