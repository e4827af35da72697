//! Web proxy middleware: routes worker-served pages to the right
//! container.
//!
//! Hosted-link paths end with a `{hostname}-{id}` segment and go to the
//! worker that generated the link; static paths and the home page go to a
//! random standby. Everything else falls through to the next layer.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use engine::container::Container;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::state::AppState;

pub const HOSTED_LINK_PATHS: &[&str] = &["/link", "/api/auth", "/api/link", "/dpage"];
pub const STATIC_PATHS: &[&str] = &["/__assets", "/__static"];

const WEB_BODY_LIMIT: usize = 10 * 1024 * 1024;

fn is_hosted_link(path: &str) -> bool {
    HOSTED_LINK_PATHS.iter().any(|prefix| path.starts_with(prefix))
}

fn is_worker_agnostic(path: &str) -> bool {
    STATIC_PATHS.iter().any(|prefix| path.starts_with(prefix)) || path == "/"
}

pub async fn web_proxy_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if !is_hosted_link(&path) && !is_worker_agnostic(&path) {
        return next.run(request).await;
    }

    let container = match resolve_container(&state, &path).await {
        Ok(container) => container,
        Err(error) => {
            warn!(url = %path, %error, "invalid worker-bound url");
            return (StatusCode::BAD_REQUEST, "Invalid url").into_response();
        }
    };

    match forward(&state, request, &container).await {
        Ok(response) => response,
        Err(error) => {
            warn!(container = %container.name, %error, "web proxy upstream failed");
            (StatusCode::BAD_GATEWAY, "upstream error").into_response()
        }
    }
}

/// Hosted-link paths end with a link id in the form `{hostname}-{id}`.
pub fn hostname_from_link(path: &str) -> GatewayResult<String> {
    let link_id = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    let (hostname, _) = link_id
        .rsplit_once('-')
        .ok_or_else(|| GatewayError::RouteInvalid(format!("invalid link id: {link_id}")))?;
    if hostname.is_empty() {
        return Err(GatewayError::RouteInvalid(format!(
            "invalid link id: {link_id}"
        )));
    }
    Ok(hostname.to_string())
}

async fn resolve_container(state: &AppState, path: &str) -> GatewayResult<Container> {
    if is_worker_agnostic(path) {
        return Ok(state.manager.get_unassigned_container().await?);
    }
    let hostname = hostname_from_link(path)?;
    Ok(state.manager.get_container_by_hostname(&hostname).await?)
}

async fn forward(
    state: &AppState,
    request: Request,
    container: &Container,
) -> GatewayResult<Response> {
    let path = request.uri().path();
    info!(container = %container.name, path, "proxying web request");

    let mut url = format!("http://{}{}", container.validated_ip()?, path);
    if let Some(query) = request.uri().query() {
        url.push('?');
        url.push_str(query);
    }

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, WEB_BODY_LIMIT)
        .await
        .map_err(|error| GatewayError::Upstream(format!("failed to read request body: {error}")))?;

    let response = state
        .http
        .request(parts.method, &url)
        .headers(request_headers(&parts.headers))
        .body(bytes)
        .timeout(Duration::from_secs(state.config.proxy_read_timeout_secs))
        .send()
        .await
        .map_err(|error| GatewayError::Upstream(error.to_string()))?;

    let status = response.status();
    let headers = crate::proxies::mcp::proxied_response_headers(response.headers());
    let body = response
        .bytes()
        .await
        .map_err(|error| GatewayError::Upstream(error.to_string()))?;
    Ok((status, headers, Body::from(body)).into_response())
}

fn request_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = incoming.clone();
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    headers
}
