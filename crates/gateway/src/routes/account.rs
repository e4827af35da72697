//! Account pages: a small test/admin flow that resolves the caller's
//! user and container.
//!
//! Two ways in:
//! - a bearer token on the request returns the data directly;
//! - a browser without one is sent through the gateway's own `/authorize`
//!   façade as the internal `account` client; `/client/auth/callback`
//!   redeems the code and 307-redirects back here with a one-time state.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use engine::user::AuthUser;
use serde::Deserialize;
use serde_json::json;
use url::Url;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::http_utils::{bearer_token, request_origin};
use crate::state::AppState;

pub const ACCOUNT_CLIENT_ID: &str = "account";

/// One in-flight `/account` browser flow, keyed by the `state` parameter.
#[derive(Debug, Clone)]
pub struct AccountFlow {
    pub mcp_name: String,
    pub data_format: String,
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AccountQuery {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default = "default_data_format")]
    pub data_format: String,
}

fn default_data_format() -> String {
    "html".to_string()
}

pub async fn account(
    State(state): State<AppState>,
    Path(mcp_name): Path<String>,
    Query(query): Query<AccountQuery>,
    headers: HeaderMap,
) -> GatewayResult<Response> {
    let origin = request_origin(&headers, &state.config.gateway_origin);

    // second pass: the callback stored a token under this state
    if let Some(flow_state) = &query.state {
        let Some((_, flow)) = state.account_flows.remove(flow_state) else {
            return Err(GatewayError::RouteInvalid("invalid state".into()));
        };
        let Some(token) = flow.access_token else {
            return Err(GatewayError::AuthTokenInvalid(
                "authorization not completed".into(),
            ));
        };
        let user = state.verify_bearer(&origin, &token).await?;
        return account_response(&state, &user, &flow.data_format).await;
    }

    // direct pass for API callers carrying a bearer token
    if let Some(token) = bearer_token(&headers) {
        let user = state.verify_bearer(&origin, token).await?;
        return account_response(&state, &user, &query.data_format).await;
    }

    // first pass: start the browser flow through the authorization façade
    let flow_state = Uuid::new_v4().to_string();
    state.account_flows.insert(
        flow_state.clone(),
        AccountFlow {
            mcp_name,
            data_format: query.data_format,
            access_token: None,
        },
    );

    let redirect_uri = format!("{origin}/client/auth/callback");
    let authorize = Url::parse_with_params(
        &format!("{origin}/authorize"),
        &[
            ("client_id", ACCOUNT_CLIENT_ID),
            ("redirect_uri", redirect_uri.as_str()),
            ("response_type", "code"),
            ("state", flow_state.as_str()),
        ],
    )
    .map_err(|error| GatewayError::Config(format!("bad gateway origin: {error}")))?;
    Ok(Redirect::to(authorize.as_str()).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ClientCallbackQuery {
    pub code: String,
    pub state: String,
}

/// Final leg of the `/account` flow: redeem the code with the provider
/// remembered for the internal client, then bounce back to the account
/// page.
pub async fn client_auth_callback(
    State(state): State<AppState>,
    Query(query): Query<ClientCallbackQuery>,
) -> GatewayResult<Redirect> {
    let Some(mut flow) = state.account_flows.get_mut(&query.state) else {
        return Err(GatewayError::RouteInvalid("invalid state".into()));
    };

    let provider = state.oauth.provider_for_client(ACCOUNT_CLIENT_ID)?;
    let token = provider.exchange_code(ACCOUNT_CLIENT_ID, &query.code)?;
    flow.access_token = Some(token.access_token);

    let mut url = format!("/account/{}?state={}", flow.mcp_name, query.state);
    if flow.data_format == "json" {
        url.push_str("&data_format=json");
    }
    drop(flow);
    Ok(Redirect::temporary(&url))
}

async fn account_response(
    state: &AppState,
    user: &AuthUser,
    data_format: &str,
) -> GatewayResult<Response> {
    let container = state.manager.get_user_container(user).await?;
    let manager_info = state.manager.manager_info();

    if data_format == "json" {
        return Ok(Json(json!({
            "user": user,
            "is_admin": user.is_admin(&state.config.admin_email_domain),
            "container": container,
            "manager_info": manager_info,
        }))
        .into_response());
    }

    Ok(Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Account</title></head>
<body>
<h1>Account</h1>
<p>User: {user_id}</p>
<p>Container: {name} ({status:?})</p>
<p>Started: {started_at}</p>
<p>Active pool: {active}/{capacity}, TTL {ttl}s</p>
</body>
</html>"#,
        user_id = user.user_id(),
        name = container.name,
        status = container.status,
        started_at = container.started_at.to_rfc3339(),
        active = manager_info.active_containers,
        capacity = manager_info.active_capacity,
        ttl = manager_info.ttl_seconds,
    ))
    .into_response())
}
