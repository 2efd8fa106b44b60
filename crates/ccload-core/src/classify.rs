//! Inbound path routing (spec §6 client surface), simplified from the
//! teacher's per-operation dialect classifier since this core forwards
//! each channel in its native dialect rather than transforming between
//! them.

use axum::http::Method;

use crate::error::ProxyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `POST /v1/*` or `POST /v1beta/*` (any subpath) — forward upstream.
    Forward { path: String, is_claude_family: bool },
    /// `GET /v1/models` or `GET /v1beta/models` — answer locally.
    ListModels { is_claude_family: bool },
    /// `POST /v1/messages/count_tokens` — local estimation, no upstream call.
    CountTokens,
}

pub fn classify(method: &Method, path: &str) -> Result<Route, ProxyError> {
    let trimmed = path.trim_start_matches('/');
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();

    let is_claude_family = matches!(segments.first().copied(), Some("v1"));
    let is_gemini_family = matches!(segments.first().copied(), Some("v1beta"));
    if !is_claude_family && !is_gemini_family {
        return Err(ProxyError::not_found("unknown path"));
    }

    match segments.as_slice() {
        ["v1", "messages", "count_tokens"] if *method == Method::POST => Ok(Route::CountTokens),
        ["v1", "models"] | ["v1beta", "models"] if *method == Method::GET => {
            Ok(Route::ListModels { is_claude_family })
        }
        _ => Ok(Route::Forward {
            path: path.to_string(),
            is_claude_family,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_tokens_is_routed_locally() {
        let route = classify(&Method::POST, "/v1/messages/count_tokens").unwrap();
        assert_eq!(route, Route::CountTokens);
    }

    #[test]
    fn models_list_is_routed_locally() {
        let route = classify(&Method::GET, "/v1beta/models").unwrap();
        assert_eq!(route, Route::ListModels { is_claude_family: false });
    }

    #[test]
    fn unrelated_path_is_forwarded() {
        let route = classify(&Method::POST, "/v1/messages").unwrap();
        assert_eq!(
            route,
            Route::Forward {
                path: "/v1/messages".into(),
                is_claude_family: true,
            }
        );
    }

    #[test]
    fn unknown_family_is_rejected() {
        assert!(classify(&Method::GET, "/oauth").is_err());
    }
}
