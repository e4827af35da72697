//! Bearer-auth middleware for MCP routes.
//!
//! Any path under `/mcp` requires a valid bearer token. Requests from
//! non-MCP clients (no `text/event-stream` in `Accept`) are redirected to
//! the home page instead. Other routes pass through untouched.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::warn;

use crate::http_utils::{accepts_event_stream, bearer_token, request_origin, token_prefix};
use crate::state::AppState;

pub async fn mcp_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if !request.uri().path().starts_with("/mcp") {
        return next.run(request).await;
    }

    if !accepts_event_stream(request.headers()) {
        return Redirect::temporary("/").into_response();
    }

    let origin = request_origin(request.headers(), &state.config.gateway_origin);
    let Some(token) = bearer_token(request.headers()).map(str::to_string) else {
        return unauthorized(&origin);
    };

    match state.verify_bearer(&origin, &token).await {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(error) => {
            warn!(
                token_prefix = token_prefix(&token),
                %error,
                "rejected MCP request"
            );
            unauthorized(&origin)
        }
    }
}

fn unauthorized(origin: &str) -> Response {
    let www_authenticate = format!(
        r#"Bearer resource_metadata="{origin}/.well-known/oauth-protected-resource""#
    );
    let mut headers = HeaderMap::new();
    if let Ok(value) = www_authenticate.parse() {
        headers.insert(axum::http::header::WWW_AUTHENTICATE, value);
    }
    (StatusCode::UNAUTHORIZED, headers, "invalid or missing token").into_response()
}
