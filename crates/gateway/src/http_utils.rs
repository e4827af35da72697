//! Small HTTP helpers shared across middleware and handlers.

use axum::http::header::{ACCEPT, AUTHORIZATION, HOST};
use axum::http::HeaderMap;

/// Public origin of the incoming request.
///
/// Behind a proxy (e.g. a load balancer) the public origin is the origin
/// of the proxy, carried in the forwarded headers.
pub fn request_origin(headers: &HeaderMap, fallback: &str) -> String {
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(HOST))
        .and_then(|value| value.to_str().ok());
    match host {
        Some(host) => format!("{proto}://{host}"),
        None => fallback.to_string(),
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
}

pub fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false)
}

/// Loggable token prefix. Never log the whole token.
pub fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(index, _)| index)
        .unwrap_or(token.len());
    &token[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_request_origin_prefers_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("internal:9000"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("gw.example.com"));
        assert_eq!(
            request_origin(&headers, "http://fallback"),
            "https://gw.example.com"
        );
    }

    #[test]
    fn test_request_origin_falls_back_to_host_then_default() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("internal:9000"));
        assert_eq!(
            request_origin(&headers, "http://fallback"),
            "http://internal:9000"
        );
        assert_eq!(
            request_origin(&HeaderMap::new(), "http://fallback"),
            "http://fallback"
        );
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer gho_abc"));
        assert_eq!(bearer_token(&headers), Some("gho_abc"));

        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&basic), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_token_prefix_is_bounded() {
        assert_eq!(token_prefix("getgather_app_u42"), "getgathe");
        assert_eq!(token_prefix("abc"), "abc");
    }
}
