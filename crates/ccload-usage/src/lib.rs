//! Incremental token-usage extraction (spec §4.7).

mod sse;

use ccload_common::ChannelType;
use serde_json::Value;
use sse::SseParser;
use tracing::debug;

const BUFFER_CEILING: usize = 1024 * 1024;
const EVENT_BLACKLIST: &[&str] = &["ping", "content_block_start", "content_block_delta"];

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageSnapshot {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_creation_5m: Option<i64>,
    pub cache_creation_1h: Option<i64>,
}

#[derive(Debug, Default)]
struct RawUsage {
    input: i64,
    output: i64,
    cache_read: i64,
    cache_creation: i64,
    cache_5m: Option<i64>,
    cache_1h: Option<i64>,
    input_is_positive: bool,
}

/// Feeds a streaming or non-streaming response body and extracts the
/// four token counters. Never panics on malformed input; a hard
/// size-limit violation switches to a no-op "oversized" mode rather
/// than erroring the whole forward.
pub struct UsageParser {
    channel_type: ChannelType,
    sse: SseParser,
    raw: RawUsage,
    buffered: Vec<u8>,
    oversized: bool,
    last_error: Option<Vec<u8>>,
    is_streaming: bool,
}

impl UsageParser {
    pub fn new(channel_type: ChannelType, is_streaming: bool) -> Self {
        Self {
            channel_type,
            sse: SseParser::new(),
            raw: RawUsage::default(),
            buffered: Vec::new(),
            oversized: false,
            last_error: None,
            is_streaming,
        }
    }

    /// Appends `chunk` and parses whatever complete events are now
    /// available. Safe to call repeatedly; splitting the same overall
    /// byte stream at any point must yield the same final usage
    /// (invariant 6).
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.oversized {
            return;
        }

        if self.is_streaming {
            let Ok(text) = std::str::from_utf8(chunk) else {
                return;
            };
            if self.buffered.len() + chunk.len() > BUFFER_CEILING {
                self.oversized = true;
                self.buffered.clear();
                return;
            }
            self.buffered.extend_from_slice(chunk);
            let events = self.sse.push_str(text);
            for event in events {
                self.consume_event(event.event.as_deref(), &event.data);
            }
        } else {
            if self.buffered.len() + chunk.len() > BUFFER_CEILING {
                self.oversized = true;
                self.buffered.clear();
                return;
            }
            self.buffered.extend_from_slice(chunk);
        }
    }

    /// Call once the body has ended; flushes trailing SSE state or
    /// parses the fully-buffered non-streaming JSON body.
    pub fn finish(&mut self) {
        if self.oversized {
            return;
        }
        if self.is_streaming {
            let events = self.sse.finish();
            for event in events {
                self.consume_event(event.event.as_deref(), &event.data);
            }
        } else if !self.buffered.is_empty() {
            if let Ok(value) = serde_json::from_slice::<Value>(&self.buffered) {
                self.apply_usage_from_json(&value);
            }
        }
    }

    fn consume_event(&mut self, event_name: Option<&str>, data: &str) {
        if let Some(name) = event_name {
            if EVENT_BLACKLIST.contains(&name) {
                return;
            }
            if name == "error" {
                self.last_error = Some(data.as_bytes().to_vec());
            }
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            debug!(event = "usage_parse_skip", "non-json sse event payload");
            return;
        };
        self.apply_usage_from_json(&value);
    }

    fn apply_usage_from_json(&mut self, value: &Value) {
        let Some(usage) = find_usage_object(value) else {
            return;
        };
        let is_anthropic = matches!(self.channel_type, ChannelType::Anthropic);

        match self.channel_type {
            ChannelType::Anthropic => {
                if let Some(v) = usage.get("input_tokens").and_then(Value::as_i64) {
                    if !(is_anthropic && v == 0 && self.raw.input_is_positive) {
                        self.raw.input = v;
                        self.raw.input_is_positive = v > 0;
                    }
                }
                if let Some(v) = usage.get("output_tokens").and_then(Value::as_i64) {
                    self.raw.output = v;
                }
                if let Some(v) = usage.get("cache_read_input_tokens").and_then(Value::as_i64) {
                    self.raw.cache_read = v;
                }
                if let Some(v) = usage.get("cache_creation_input_tokens").and_then(Value::as_i64) {
                    self.raw.cache_creation = v;
                }
                if let Some(split) = usage.get("cache_creation").and_then(Value::as_object) {
                    if let Some(v) = split.get("ephemeral_5m_input_tokens").and_then(Value::as_i64) {
                        self.raw.cache_5m = Some(v);
                    }
                    if let Some(v) = split.get("ephemeral_1h_input_tokens").and_then(Value::as_i64) {
                        self.raw.cache_1h = Some(v);
                    }
                }
            }
            ChannelType::Openai => {
                if let Some(v) = usage.get("prompt_tokens").and_then(Value::as_i64) {
                    self.raw.input = v;
                }
                if let Some(v) = usage.get("completion_tokens").and_then(Value::as_i64) {
                    self.raw.output = v;
                }
                if let Some(v) = usage
                    .get("prompt_tokens_details")
                    .and_then(Value::as_object)
                    .and_then(|d| d.get("cached_tokens"))
                    .and_then(Value::as_i64)
                {
                    self.raw.cache_read = v;
                }
            }
            ChannelType::Codex => {
                if let Some(v) = usage.get("input_tokens").and_then(Value::as_i64) {
                    self.raw.input = v;
                }
                if let Some(v) = usage.get("output_tokens").and_then(Value::as_i64) {
                    self.raw.output = v;
                }
                if let Some(v) = usage
                    .get("input_tokens_details")
                    .and_then(Value::as_object)
                    .and_then(|d| d.get("cached_tokens"))
                    .and_then(Value::as_i64)
                {
                    self.raw.cache_read = v;
                }
            }
            ChannelType::Gemini => {
                let prompt = usage.get("promptTokenCount").and_then(Value::as_i64).unwrap_or(self.raw.input);
                self.raw.input = prompt;
                let candidates = usage.get("candidatesTokenCount").and_then(Value::as_i64).unwrap_or(0);
                let thoughts = usage.get("thoughtsTokenCount").and_then(Value::as_i64).unwrap_or(0);
                let mut output = candidates + thoughts;
                if output == 0 {
                    if let Some(total) = usage.get("totalTokenCount").and_then(Value::as_i64) {
                        output = (total - prompt).max(0);
                    }
                }
                self.raw.output = output;
                if let Some(v) = usage.get("cachedContentTokenCount").and_then(Value::as_i64) {
                    self.raw.cache_read = v;
                }
            }
        }
    }

    /// Final values with channel-type-specific normalization applied
    /// (OpenAI-family and Gemini: billable input =
    /// max(0, raw_input - cache_read)).
    pub fn usage(&self) -> UsageSnapshot {
        let input_tokens = match self.channel_type {
            ChannelType::Openai | ChannelType::Codex | ChannelType::Gemini => {
                (self.raw.input - self.raw.cache_read).max(0)
            }
            ChannelType::Anthropic => self.raw.input,
        };
        UsageSnapshot {
            input_tokens,
            output_tokens: self.raw.output,
            cache_read_input_tokens: self.raw.cache_read,
            cache_creation_input_tokens: self.raw.cache_creation,
            cache_creation_5m: self.raw.cache_5m,
            cache_creation_1h: self.raw.cache_1h,
        }
    }

    pub fn last_error(&self) -> Option<&[u8]> {
        self.last_error.as_deref()
    }

    pub fn is_oversized(&self) -> bool {
        self.oversized
    }
}

/// Finds the usage object under one of the shapes §4.7 lists:
/// `{usage}`, `{message:{usage}}`, `{response:{usage}}`,
/// `{usageMetadata}` (direct or wrapped under message/response).
fn find_usage_object(value: &Value) -> Option<&Value> {
    if let Some(u) = value.get("usage") {
        return Some(u);
    }
    if let Some(u) = value.get("usageMetadata") {
        return Some(u);
    }
    for wrapper in ["message", "response"] {
        if let Some(inner) = value.get(wrapper) {
            if let Some(u) = inner.get("usage") {
                return Some(u);
            }
            if let Some(u) = inner.get("usageMetadata") {
                return Some(u);
            }
        }
    }
    None
}

pub use sse::{SseEvent, SseParser as RawSseParser};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_anthropic_message_delta_zero_does_not_overwrite_input() {
        let mut parser = UsageParser::new(ChannelType::Anthropic, true);
        parser.feed(b"event: message_start\ndata: {\"usage\":{\"input_tokens\":12,\"output_tokens\":1,\"cache_read_input_tokens\":17558,\"cache_creation_input_tokens\":278}}\n\n");
        parser.feed(b"event: message_delta\ndata: {\"usage\":{\"input_tokens\":0,\"output_tokens\":73}}\n\n");
        parser.finish();
        let usage = parser.usage();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 73);
        assert_eq!(usage.cache_read_input_tokens, 17558);
        assert_eq!(usage.cache_creation_input_tokens, 278);
    }

    #[test]
    fn s4_openai_billable_input_normalization() {
        let mut parser = UsageParser::new(ChannelType::Openai, false);
        parser.feed(br#"{"usage":{"prompt_tokens":500,"completion_tokens":200,"prompt_tokens_details":{"cached_tokens":350}}}"#);
        parser.finish();
        let usage = parser.usage();
        assert_eq!(usage.input_tokens, 150);
        assert_eq!(usage.output_tokens, 200);
        assert_eq!(usage.cache_read_input_tokens, 350);
        assert_eq!(usage.cache_creation_input_tokens, 0);
    }

    #[test]
    fn invariant6_incremental_parsing_is_split_independent() {
        let body = b"event: message_start\ndata: {\"usage\":{\"input_tokens\":12,\"output_tokens\":1,\"cache_read_input_tokens\":5,\"cache_creation_input_tokens\":2}}\n\nevent: message_delta\ndata: {\"usage\":{\"input_tokens\":0,\"output_tokens\":99}}\n\n";
        let whole = {
            let mut p = UsageParser::new(ChannelType::Anthropic, true);
            p.feed(body);
            p.finish();
            p.usage()
        };
        for split in 0..body.len() {
            let mut p = UsageParser::new(ChannelType::Anthropic, true);
            p.feed(&body[..split]);
            p.feed(&body[split..]);
            p.finish();
            assert_eq!(p.usage(), whole, "split at {split} diverged");
        }
    }

    #[test]
    fn blacklisted_events_are_ignored() {
        let mut parser = UsageParser::new(ChannelType::Anthropic, true);
        parser.feed(b"event: content_block_delta\ndata: {\"usage\":{\"input_tokens\":999}}\n\n");
        parser.finish();
        assert_eq!(parser.usage().input_tokens, 0);
    }

    #[test]
    fn sse_embedded_error_is_captured() {
        let mut parser = UsageParser::new(ChannelType::Anthropic, true);
        parser.feed(b"event: error\ndata: {\"type\":\"overloaded_error\"}\n\n");
        parser.finish();
        assert!(parser.last_error().is_some());
    }

    #[test]
    fn oversized_buffer_stops_feeding_without_panicking() {
        let mut parser = UsageParser::new(ChannelType::Anthropic, false);
        let chunk = vec![b'a'; 1024 * 1024 + 1];
        parser.feed(&chunk);
        assert!(parser.is_oversized());
        parser.finish();
        assert_eq!(parser.usage().input_tokens, 0);
    }

    #[test]
    fn gemini_input_tokens_exclude_cached_content() {
        let mut parser = UsageParser::new(ChannelType::Gemini, false);
        parser.feed(br#"{"usageMetadata":{"promptTokenCount":10,"totalTokenCount":30,"cachedContentTokenCount":2}}"#);
        parser.finish();
        let usage = parser.usage();
        assert_eq!(usage.input_tokens, 8);
        assert_eq!(usage.output_tokens, 20);
        assert_eq!(usage.cache_read_input_tokens, 2);
    }
}
