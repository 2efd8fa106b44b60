//! Model matching (spec §4.2 step 1): exact, date-suffix-stripped, and
//! fuzzy (case-insensitive substring) lookup against a channel's
//! configured model entries.

use ccload_storage::types::Channel;

/// Returns the effective upstream model name to forward with, or
/// `None` if `channel` does not serve `requested_model`. For the
/// wildcard model, the caller's original model name passes through
/// unmodified (`None` means "do not rewrite the body").
pub fn match_model(
    requested_model: &str,
    channel: &Channel,
    strip_date_suffix: bool,
    fuzzy_match: bool,
) -> Option<Option<String>> {
    if requested_model == "*" {
        return Some(None);
    }

    if let Some(entry) = channel.models.iter().find(|m| m.name == requested_model) {
        return Some(Some(entry.redirect.clone().unwrap_or_else(|| entry.name.clone())));
    }

    if strip_date_suffix {
        if let Some(stripped) = strip_trailing_date_suffix(requested_model) {
            if let Some(entry) = channel.models.iter().find(|m| m.name == stripped) {
                return Some(Some(entry.redirect.clone().unwrap_or_else(|| entry.name.clone())));
            }
        }
    }

    if fuzzy_match {
        let needle = requested_model.to_lowercase();
        if let Some(entry) = channel
            .models
            .iter()
            .find(|m| needle.contains(&m.name.to_lowercase()))
        {
            return Some(Some(entry.redirect.clone().unwrap_or_else(|| entry.name.clone())));
        }
    }

    None
}

/// Strips a trailing `-YYYYMMDD` suffix when it is a plausible
/// calendar date: YYYY∈[2000,2100], MM∈[1,12], DD≤days-in-month.
fn strip_trailing_date_suffix(model: &str) -> Option<&str> {
    let dash_idx = model.rfind('-')?;
    let (base, suffix) = model.split_at(dash_idx);
    let digits = &suffix[1..];
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: u32 = digits[0..4].parse().ok()?;
    let month: u32 = digits[4..6].parse().ok()?;
    let day: u32 = digits[6..8].parse().ok()?;
    if !(2000..=2100).contains(&year) || !(1..=12).contains(&month) {
        return None;
    }
    if day == 0 || day > days_in_month(year, month) {
        return None;
    }
    if base.is_empty() {
        return None;
    }
    Some(base)
}

fn days_in_month(year: u32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

fn is_leap_year(year: u32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccload_common::{ChannelType, KeyStrategy};
    use ccload_storage::types::ModelEntry;

    fn channel_with(name: &str, redirect: Option<&str>) -> Channel {
        Channel {
            id: 1,
            name: "c".into(),
            url: "https://api.example.com".into(),
            channel_type: ChannelType::Anthropic,
            priority: 1,
            enabled: true,
            models: vec![ModelEntry {
                name: name.into(),
                redirect: redirect.map(String::from),
            }],
            key_strategy: KeyStrategy::Sequential,
            key_count: 1,
        }
    }

    #[test]
    fn s1_date_suffix_fallback_yields_base_name() {
        let c = channel_with("claude-3-5-sonnet", None);
        let result = match_model("claude-3-5-sonnet-20241022", &c, true, false);
        assert_eq!(result, Some(Some("claude-3-5-sonnet".to_string())));
    }

    #[test]
    fn date_suffix_disabled_does_not_match() {
        let c = channel_with("claude-3-5-sonnet", None);
        assert_eq!(match_model("claude-3-5-sonnet-20241022", &c, false, false), None);
    }

    #[test]
    fn invalid_date_suffix_is_rejected() {
        let c = channel_with("claude-3-5-sonnet", None);
        // month 13 is invalid.
        assert_eq!(match_model("claude-3-5-sonnet-20241322", &c, true, false), None);
    }

    #[test]
    fn exact_match_honors_redirect() {
        let c = channel_with("claude-3-5-sonnet", Some("claude-3-5-sonnet-v2"));
        let result = match_model("claude-3-5-sonnet", &c, true, false);
        assert_eq!(result, Some(Some("claude-3-5-sonnet-v2".to_string())));
    }

    #[test]
    fn wildcard_model_matches_without_rewrite() {
        let c = channel_with("claude-3-5-sonnet", None);
        assert_eq!(match_model("*", &c, true, false), Some(None));
    }

    #[test]
    fn fuzzy_match_is_case_insensitive_substring() {
        let c = channel_with("sonnet", None);
        let result = match_model("claude-3-5-SONNET-latest", &c, false, true);
        assert_eq!(result, Some(Some("sonnet".to_string())));
    }
}
