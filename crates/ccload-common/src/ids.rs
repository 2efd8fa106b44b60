use serde::{Deserialize, Serialize};

/// Stable integer id of a Channel row.
pub type ChannelId = i64;

/// 0-based, dense key index within a channel.
pub type KeyIndex = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Anthropic,
    Openai,
    Codex,
    Gemini,
}

impl ChannelType {
    /// Header used to carry the upstream API key for this channel type.
    pub fn auth_header(self) -> &'static str {
        match self {
            ChannelType::Anthropic => "x-api-key",
            ChannelType::Openai | ChannelType::Codex => "authorization",
            ChannelType::Gemini => "x-goog-api-key",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelType::Anthropic => "anthropic",
            ChannelType::Openai => "openai",
            ChannelType::Codex => "codex",
            ChannelType::Gemini => "gemini",
        }
    }
}

impl std::str::FromStr for ChannelType {
    type Err = ();

    /// Unknown types fail closed; callers that must not reject (the
    /// forwarder, at call time) fall back to `Anthropic` per spec §4.6.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(ChannelType::Anthropic),
            "openai" => Ok(ChannelType::Openai),
            "codex" => Ok(ChannelType::Codex),
            "gemini" => Ok(ChannelType::Gemini),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    Sequential,
    RoundRobin,
}

impl std::str::FromStr for KeyStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(KeyStrategy::Sequential),
            "round_robin" => Ok(KeyStrategy::RoundRobin),
            _ => Err(()),
        }
    }
}
