//! Channel/key selector (spec §4.2): model matching, cooldown pruning,
//! health-aware effective priority, and smooth-weighted round-robin
//! within a priority group.

mod model_match;
mod swrr;

use std::collections::HashMap;
use std::sync::Mutex;

use ccload_common::{ChannelId, ChannelType, KeyIndex, KeyStrategy};
use ccload_health::HealthCache;
use ccload_storage::types::Channel;
use time::OffsetDateTime;

pub use model_match::match_model;
use swrr::{SwrrEntry, swrr_round};

#[derive(Debug, Clone)]
pub struct Candidate {
    pub channel_id: ChannelId,
    pub key_index: KeyIndex,
    /// The model name to send upstream, when it differs from the
    /// caller's requested model (§4.6 request body rewrite).
    pub effective_model: Option<String>,
}

pub struct SelectInput<'a> {
    pub model: &'a str,
    pub channels: &'a [Channel],
    pub channel_cooldowns: &'a HashMap<ChannelId, OffsetDateTime>,
    pub key_cooldowns: &'a HashMap<(ChannelId, KeyIndex), OffsetDateTime>,
    pub health: &'a HealthCache,
    pub strip_date_suffix: bool,
    pub fuzzy_match: bool,
    pub health_score_enabled: bool,
}

#[derive(Default)]
pub struct Selector {
    swrr_state: Mutex<HashMap<Vec<ChannelId>, Vec<SwrrEntry>>>,
    round_robin_cursor: Mutex<HashMap<ChannelId, u32>>,
}

struct MatchedChannel<'a> {
    channel: &'a Channel,
    effective_model: Option<String>,
    available_keys: Vec<KeyIndex>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all SWRR state; called by the admin layer after a
    /// channel write (spec §4.2 step 5).
    pub fn invalidate(&self) {
        self.swrr_state.lock().unwrap().clear();
    }

    pub fn select(&self, input: &SelectInput<'_>) -> Vec<Candidate> {
        let now = OffsetDateTime::now_utc();

        // Step 1 + 2: model match, then channel- and key-level cooldown prune.
        let mut matched: Vec<MatchedChannel<'_>> = Vec::new();
        for channel in input.channels {
            if !channel.enabled {
                continue;
            }
            let is_cooled = input
                .channel_cooldowns
                .get(&channel.id)
                .is_some_and(|exp| now < *exp);
            if is_cooled {
                continue;
            }
            let Some(effective_model) =
                match_model(input.model, channel, input.strip_date_suffix, input.fuzzy_match)
            else {
                continue;
            };

            let available_keys: Vec<KeyIndex> = (0..channel.key_count)
                .filter(|idx| {
                    !input
                        .key_cooldowns
                        .get(&(channel.id, *idx))
                        .is_some_and(|exp| now < *exp)
                })
                .collect();
            if available_keys.is_empty() {
                continue;
            }

            matched.push(MatchedChannel {
                channel,
                effective_model,
                available_keys,
            });
        }

        if matched.is_empty() {
            return Vec::new();
        }

        // Step 3: effective priority, bucketed to 1-decimal granularity.
        let bucket_of = |m: &MatchedChannel<'_>| -> i64 {
            let mut priority = m.channel.priority as f64;
            if input.health_score_enabled {
                priority *= input.health.success_rate(m.channel.id);
            }
            round_half_away_from_zero(priority * 10.0)
        };

        // Step 4: group by bucket, descending.
        let mut buckets: HashMap<i64, Vec<MatchedChannel<'_>>> = HashMap::new();
        for m in matched {
            buckets.entry(bucket_of(&m)).or_default().push(m);
        }
        let mut bucket_keys: Vec<i64> = buckets.keys().copied().collect();
        bucket_keys.sort_unstable_by(|a, b| b.cmp(a));

        let mut out = Vec::new();
        for bucket in bucket_keys {
            let group = buckets.remove(&bucket).unwrap();
            self.emit_group(group, &mut out);
        }
        out
    }

    fn emit_group(&self, mut group: Vec<MatchedChannel<'_>>, out: &mut Vec<Candidate>) {
        if group.len() == 1 {
            let only = group.pop().unwrap();
            self.emit_channel(&only, out);
            return;
        }

        let mut ids: Vec<ChannelId> = group.iter().map(|m| m.channel.id).collect();
        ids.sort_unstable();

        let weights: HashMap<ChannelId, i64> = group
            .iter()
            .map(|m| (m.channel.id, m.available_keys.len().max(1) as i64))
            .collect();

        let order = {
            let mut state_map = self.swrr_state.lock().unwrap();
            let entries = state_map.entry(ids.clone()).or_insert_with(|| {
                ids.iter()
                    .map(|id| SwrrEntry {
                        channel_id: *id,
                        weight: weights[id],
                        current_weight: 0,
                    })
                    .collect()
            });
            swrr_round(entries, &weights)
        };

        let by_id: HashMap<ChannelId, MatchedChannel<'_>> =
            group.drain(..).map(|m| (m.channel.id, m)).collect();
        for id in order {
            if let Some(m) = by_id.get(&id) {
                self.emit_channel(m, out);
            }
        }
    }

    fn emit_channel(&self, m: &MatchedChannel<'_>, out: &mut Vec<Candidate>) {
        let key_order: Vec<KeyIndex> = match m.channel.key_strategy {
            KeyStrategy::Sequential => {
                let mut keys = m.available_keys.clone();
                keys.sort_unstable();
                keys
            }
            KeyStrategy::RoundRobin => {
                let key_count = m.channel.key_count.max(1);
                let mut cursor = self.round_robin_cursor.lock().unwrap();
                let start = *cursor.get(&m.channel.id).unwrap_or(&0) % key_count;
                cursor.insert(m.channel.id, (start + 1) % key_count);
                drop(cursor);

                let mut ordered = Vec::with_capacity(m.available_keys.len());
                for step in 0..key_count {
                    let idx = (start + step) % key_count;
                    if m.available_keys.contains(&idx) {
                        ordered.push(idx);
                    }
                }
                ordered
            }
        };

        for key_index in key_order {
            out.push(Candidate {
                channel_id: m.channel.id,
                key_index,
                effective_model: m.effective_model.clone(),
            });
        }
    }
}

/// `round(x)` with half-away-from-zero, used to bucket effective
/// priority so float edges near integer boundaries don't churn group
/// membership (spec §4.2 step 3).
fn round_half_away_from_zero(x: f64) -> i64 {
    if x >= 0.0 {
        (x + 0.5).floor() as i64
    } else {
        (x - 0.5).ceil() as i64
    }
}

pub fn channel_matches_type(channel: &Channel, t: ChannelType) -> bool {
    channel.channel_type as u8 == t as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccload_common::ChannelType;
    use ccload_storage::types::ModelEntry;

    fn channel(id: ChannelId, priority: i32, key_count: u32, strategy: KeyStrategy) -> Channel {
        Channel {
            id,
            name: format!("c{id}"),
            url: "https://api.example.com".into(),
            channel_type: ChannelType::Anthropic,
            priority,
            enabled: true,
            models: vec![ModelEntry {
                name: "claude-3-5-sonnet".into(),
                redirect: None,
            }],
            key_strategy: strategy,
            key_count,
        }
    }

    #[test]
    fn s2_swrr_ordering_a_a_b() {
        let a = channel(1, 10, 3, KeyStrategy::Sequential);
        let b = channel(2, 10, 1, KeyStrategy::Sequential);
        let channels = vec![a, b];
        let selector = Selector::new();
        let health = HealthCache::new();
        let input = SelectInput {
            model: "claude-3-5-sonnet",
            channels: &channels,
            channel_cooldowns: &HashMap::new(),
            key_cooldowns: &HashMap::new(),
            health: &health,
            strip_date_suffix: true,
            fuzzy_match: false,
            health_score_enabled: false,
        };

        let mut first_channel_of_each_row = Vec::new();
        for _ in 0..3 {
            let result = selector.select(&input);
            first_channel_of_each_row.push(result[0].channel_id);
        }
        assert_eq!(first_channel_of_each_row, vec![1, 1, 2]);
    }

    #[test]
    fn swrr_distribution_matches_weights_over_100_picks() {
        let a = channel(1, 10, 3, KeyStrategy::Sequential);
        let b = channel(2, 10, 1, KeyStrategy::Sequential);
        let channels = vec![a, b];
        let selector = Selector::new();
        let health = HealthCache::new();
        let input = SelectInput {
            model: "claude-3-5-sonnet",
            channels: &channels,
            channel_cooldowns: &HashMap::new(),
            key_cooldowns: &HashMap::new(),
            health: &health,
            strip_date_suffix: true,
            fuzzy_match: false,
            health_score_enabled: false,
        };

        let mut counts = HashMap::new();
        let mut max_consecutive_a = 0u32;
        let mut running_a = 0u32;
        for _ in 0..100 {
            let result = selector.select(&input);
            let picked = result[0].channel_id;
            *counts.entry(picked).or_insert(0u32) += 1;
            if picked == 1 {
                running_a += 1;
                max_consecutive_a = max_consecutive_a.max(running_a);
            } else {
                running_a = 0;
            }
        }
        assert_eq!(counts.get(&1), Some(&75));
        assert_eq!(counts.get(&2), Some(&25));
        assert_eq!(max_consecutive_a, 3);
    }

    #[test]
    fn cooled_channel_excluded() {
        let a = channel(1, 10, 1, KeyStrategy::Sequential);
        let channels = vec![a];
        let selector = Selector::new();
        let health = HealthCache::new();
        let mut channel_cooldowns = HashMap::new();
        channel_cooldowns.insert(1, OffsetDateTime::now_utc() + time::Duration::minutes(5));
        let input = SelectInput {
            model: "claude-3-5-sonnet",
            channels: &channels,
            channel_cooldowns: &channel_cooldowns,
            key_cooldowns: &HashMap::new(),
            health: &health,
            strip_date_suffix: true,
            fuzzy_match: false,
            health_score_enabled: false,
        };
        assert!(selector.select(&input).is_empty());
    }

    #[test]
    fn all_keys_cooled_excludes_channel_even_without_channel_cooldown() {
        let a = channel(1, 10, 1, KeyStrategy::Sequential);
        let channels = vec![a];
        let selector = Selector::new();
        let health = HealthCache::new();
        let mut key_cooldowns = HashMap::new();
        key_cooldowns.insert((1, 0), OffsetDateTime::now_utc() + time::Duration::minutes(5));
        let input = SelectInput {
            model: "claude-3-5-sonnet",
            channels: &channels,
            channel_cooldowns: &HashMap::new(),
            key_cooldowns: &key_cooldowns,
            health: &health,
            strip_date_suffix: true,
            fuzzy_match: false,
            health_score_enabled: false,
        };
        assert!(selector.select(&input).is_empty());
    }

    #[test]
    fn round_half_away_from_zero_handles_edges() {
        assert_eq!(round_half_away_from_zero(10.05 * 10.0 / 10.0 * 10.0 - 9.95), 0);
        assert_eq!(round_half_away_from_zero(2.5), 3);
        assert_eq!(round_half_away_from_zero(-2.5), -3);
    }
}
