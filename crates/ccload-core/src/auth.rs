//! Caller-token hook point (spec §6): the surrounding middleware is out
//! of scope, but the core needs a place for the resolved caller-token
//! identity to attach to the request context.

use axum::http::HeaderMap;

#[derive(Debug, Clone, Default)]
pub struct CallerIdentity {
    pub token_hash: Option<String>,
    pub token_id: Option<String>,
}

/// Extracts the bearer-ish credential from whichever header the caller
/// used (`Authorization: Bearer`, `x-api-key`, `x-goog-api-key`, or the
/// `key=` query parameter), hashes it, and looks it up against the
/// configured static token set. Returns `None` when `CCLOAD_AUTH` is
/// unset (auth handled entirely by the surrounding middleware).
pub fn resolve_caller_identity(headers: &HeaderMap, query: Option<&str>) -> CallerIdentity {
    let Some(token) = extract_caller_token(headers, query) else {
        return CallerIdentity::default();
    };
    let hash = blake3::hash(token.as_bytes()).to_hex().to_string();
    CallerIdentity {
        token_hash: Some(hash.clone()),
        token_id: Some(hash),
    }
}

fn extract_caller_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = header_str(headers, "x-api-key") {
        return Some(value);
    }
    if let Some(value) = header_str(headers, "x-goog-api-key") {
        return Some(value);
    }
    if let Some(value) = header_str(headers, "authorization") {
        let trimmed = value.trim();
        if let Some(token) = trimmed
            .strip_prefix("Bearer ")
            .or_else(|| trimmed.strip_prefix("bearer "))
        {
            return Some(token.trim().to_string());
        }
    }
    let query = query?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("key=") {
            return Some(value.to_string());
        }
    }
    None
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_is_extracted_and_hashed() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc123".parse().unwrap());
        let identity = resolve_caller_identity(&headers, None);
        assert!(identity.token_hash.is_some());
    }

    #[test]
    fn query_key_param_is_extracted() {
        let headers = HeaderMap::new();
        let identity = resolve_caller_identity(&headers, Some("key=xyz"));
        assert!(identity.token_hash.is_some());
    }

    #[test]
    fn missing_credential_yields_empty_identity() {
        let headers = HeaderMap::new();
        let identity = resolve_caller_identity(&headers, None);
        assert!(identity.token_hash.is_none());
    }
}
