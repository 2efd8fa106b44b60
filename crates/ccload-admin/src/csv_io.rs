//! Channel CSV import/export (spec §6): a fixed, bit-exact column
//! schema so operators can round-trip a channel list through a
//! spreadsheet.

use std::collections::HashMap;
use std::io::Write;

use ccload_common::{ChannelType, KeyStrategy};
use ccload_storage::types::{Channel, ModelEntry, NewChannel};

const COLUMNS: [&str; 10] = [
    "id",
    "name",
    "api_key",
    "url",
    "priority",
    "models",
    "model_redirects",
    "channel_type",
    "key_strategy",
    "enabled",
];

const TRUTHY: [&str; 6] = ["1", "true", "yes", "启用", "enabled", "on"];

/// Serializes channels (and their keys) to CSV, UTF-8 BOM first.
pub fn export_channels(channels: &[(Channel, Vec<String>)]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_all(&[0xEF, 0xBB, 0xBF])?;
    let mut writer = csv::WriterBuilder::new().from_writer(out);
    writer.write_record(COLUMNS)?;
    for (channel, keys) in channels {
        let redirects: HashMap<&str, &str> = channel
            .models
            .iter()
            .filter_map(|m| m.redirect.as_deref().map(|r| (m.name.as_str(), r)))
            .collect();
        writer.write_record(&[
            channel.id.to_string(),
            channel.name.clone(),
            keys.join(","),
            channel.url.clone(),
            channel.priority.to_string(),
            channel.models.iter().map(|m| m.name.as_str()).collect::<Vec<_>>().join(","),
            serde_json::to_string(&redirects)?,
            channel.channel_type.as_str().to_string(),
            key_strategy_str(channel.key_strategy).to_string(),
            if channel.enabled { "true".to_string() } else { "false".to_string() },
        ])?;
    }
    Ok(writer.into_inner()?)
}

/// Parsed row ready for `Store::create_config`/`update_config`; `id`
/// is `None` for a new channel (a blank or absent `id` cell).
pub struct ImportedChannel {
    pub id: Option<i64>,
    pub channel: NewChannel,
}

pub fn import_channels(body: &[u8]) -> anyhow::Result<Vec<ImportedChannel>> {
    let body = body.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(body);
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(body);
    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let get = |i: usize| record.get(i).unwrap_or("").trim();

        let id = get(0);
        let id = if id.is_empty() { None } else { Some(id.parse::<i64>()?) };

        let api_keys: Vec<String> = get(2).split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();

        let redirects: HashMap<String, String> = {
            let cell = get(6);
            if cell.is_empty() { HashMap::new() } else { serde_json::from_str(cell)? }
        };
        let models: Vec<ModelEntry> = get(5)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|name| ModelEntry { redirect: redirects.get(name).cloned(), name: name.to_string() })
            .collect();

        let channel_type: ChannelType = get(7).parse().map_err(|_| anyhow::anyhow!("unknown channel_type: {}", get(7)))?;
        let key_strategy = parse_key_strategy(get(8))?;
        let enabled = TRUTHY.iter().any(|t| t.eq_ignore_ascii_case(get(9)));

        out.push(ImportedChannel {
            id,
            channel: NewChannel {
                name: get(1).to_string(),
                url: get(3).to_string(),
                channel_type,
                priority: get(4).parse().unwrap_or(0),
                enabled,
                models,
                key_strategy,
                api_keys,
            },
        });
    }
    Ok(out)
}

fn key_strategy_str(s: KeyStrategy) -> &'static str {
    match s {
        KeyStrategy::Sequential => "sequential",
        KeyStrategy::RoundRobin => "round_robin",
    }
}

fn parse_key_strategy(s: &str) -> anyhow::Result<KeyStrategy> {
    s.parse().map_err(|_| anyhow::anyhow!("unknown key_strategy: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_channel() -> Channel {
        Channel {
            id: 1,
            name: "primary".into(),
            url: "https://api.anthropic.com".into(),
            channel_type: ChannelType::Anthropic,
            priority: 10,
            enabled: true,
            models: vec![
                ModelEntry { name: "claude-3-5-sonnet".into(), redirect: None },
                ModelEntry { name: "claude-3-opus".into(), redirect: Some("claude-3-opus-20240229".into()) },
            ],
            key_strategy: KeyStrategy::RoundRobin,
            key_count: 2,
        }
    }

    #[test]
    fn export_starts_with_bom_and_header() {
        let csv = export_channels(&[(sample_channel(), vec!["sk-a".into(), "sk-b".into()])]).unwrap();
        assert!(csv.starts_with(&[0xEF, 0xBB, 0xBF]));
        let text = String::from_utf8_lossy(&csv);
        assert!(text.contains("sk-a,sk-b") || text.contains("\"sk-a,sk-b\""));
    }

    #[test]
    fn roundtrip_through_export_then_import() {
        let csv = export_channels(&[(sample_channel(), vec!["sk-a".into(), "sk-b".into()])]).unwrap();
        let imported = import_channels(&csv).unwrap();
        assert_eq!(imported.len(), 1);
        let row = &imported[0];
        assert_eq!(row.id, Some(1));
        assert_eq!(row.channel.api_keys, vec!["sk-a", "sk-b"]);
        assert_eq!(row.channel.models.len(), 2);
        assert!(row.channel.models.iter().any(|m| m.redirect.as_deref() == Some("claude-3-opus-20240229")));
        assert!(row.channel.enabled);
    }

    #[test]
    fn enabled_accepts_localized_truthy_token() {
        let body = format!(
            "id,name,api_key,url,priority,models,model_redirects,channel_type,key_strategy,enabled\n1,a,sk,https://x,0,m,{{}},anthropic,sequential,启用\n"
        );
        let imported = import_channels(body.as_bytes()).unwrap();
        assert!(imported[0].channel.enabled);
    }
}
