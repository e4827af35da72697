//! OAuth 2.1 authorization-server façade over the third-party providers.
//!
//! At `/authorize` one transaction is stored per configured provider and
//! the human picks a provider on `/signin`. At the shared IdP callback
//! the returned `state` is matched to exactly one provider's pending
//! transaction; that provider is remembered per `client_id` and handles
//! subsequent `/token`, refresh, and DCR-issued-client calls.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::Engine as _;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::auth::providers::{
    provider_scopes, OAuthProxyProvider, OAuthTokenResponse, ProviderName, ProviderSet,
};
use crate::auth::token::OAUTH_SCOPES;
use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::http_utils::request_origin;
use crate::proxies::mcp::McpRoute;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegisteredClient {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uris: Vec<String>,
    pub client_name: Option<String>,
    pub scope: String,
}

pub struct MultiOAuthProvider {
    primary_origin: String,
    origins: HashMap<String, ProviderSet>,
    /// client_id → provider, memoised at the IdP callback.
    client_providers: DashMap<String, Arc<OAuthProxyProvider>>,
    clients: DashMap<String, RegisteredClient>,
}

impl MultiOAuthProvider {
    pub fn from_config(config: &Config, http: reqwest::Client) -> Self {
        let mut origins = HashMap::new();
        for origin in config.origins() {
            let mut set = ProviderSet::default();
            if !config.oauth_github_client_id.is_empty()
                && !config.oauth_github_client_secret.is_empty()
            {
                set.github = Some(Arc::new(OAuthProxyProvider::new(
                    ProviderName::Github,
                    config.oauth_github_client_id.clone(),
                    config.oauth_github_client_secret.clone(),
                    origin.clone(),
                    http.clone(),
                )));
            }
            if !config.oauth_google_client_id.is_empty()
                && !config.oauth_google_client_secret.is_empty()
            {
                set.google = Some(Arc::new(OAuthProxyProvider::new(
                    ProviderName::Google,
                    config.oauth_google_client_id.clone(),
                    config.oauth_google_client_secret.clone(),
                    origin.clone(),
                    http.clone(),
                )));
            }
            origins.insert(origin, set);
        }

        Self {
            primary_origin: config.gateway_origin.clone(),
            origins,
            client_providers: DashMap::new(),
            clients: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.origins.values().any(|set| !set.is_empty())
    }

    /// Provider set for an origin, falling back to the primary origin for
    /// hosts the gateway does not know about.
    pub fn provider_set(&self, origin: &str) -> ProviderSet {
        self.origins
            .get(origin)
            .or_else(|| self.origins.get(&self.primary_origin))
            .cloned()
            .unwrap_or_default()
    }

    /// Search every provider's pending transactions for the given state.
    pub fn find_transaction(&self, txn_id: &str) -> Option<Arc<OAuthProxyProvider>> {
        self.origins
            .values()
            .flat_map(|set| set.iter())
            .find(|provider| provider.has_transaction(txn_id))
            .cloned()
    }

    pub fn remember_client_provider(&self, client_id: &str, provider: Arc<OAuthProxyProvider>) {
        self.client_providers
            .insert(client_id.to_string(), provider);
    }

    pub fn provider_for_client(&self, client_id: &str) -> GatewayResult<Arc<OAuthProxyProvider>> {
        self.client_providers
            .get(client_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::AuthTokenInvalid(format!("invalid client ID: {client_id}")))
    }

    pub fn register_client(
        &self,
        redirect_uris: Vec<String>,
        client_name: Option<String>,
    ) -> RegisteredClient {
        let client = RegisteredClient {
            client_id: Uuid::new_v4().to_string(),
            client_secret: Uuid::new_v4().to_string(),
            redirect_uris,
            client_name,
            scope: self.supported_scopes().join(" "),
        };
        self.clients.insert(client.client_id.clone(), client.clone());
        client
    }

    /// Register a client with a fixed id, used by the gateway's own
    /// `/account` browser flow.
    pub fn register_internal_client(&self, client_id: &str, redirect_uris: Vec<String>) {
        self.clients.insert(
            client_id.to_string(),
            RegisteredClient {
                client_id: client_id.to_string(),
                client_secret: Uuid::new_v4().to_string(),
                redirect_uris,
                client_name: Some(client_id.to_string()),
                scope: self.supported_scopes().join(" "),
            },
        );
    }

    pub fn validate_client_redirect(
        &self,
        client_id: &str,
        redirect_uri: &str,
    ) -> GatewayResult<RegisteredClient> {
        let client = self
            .clients
            .get(client_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                GatewayError::AuthTokenInvalid(format!("unknown client: {client_id}"))
            })?;
        if !client.redirect_uris.is_empty()
            && !client.redirect_uris.iter().any(|uri| uri == redirect_uri)
        {
            return Err(GatewayError::RouteInvalid(
                "redirect_uri not registered for client".into(),
            ));
        }
        Ok(client)
    }

    fn supported_scopes(&self) -> Vec<String> {
        let mut scopes = provider_scopes(ProviderName::Github);
        scopes.extend(provider_scopes(ProviderName::Google));
        scopes
    }
}

/// OAuth endpoints. For each `/.well-known/*` path a duplicate is also
/// mounted with every MCP route appended as a suffix.
pub fn oauth_router(mcp_routes: &[McpRoute]) -> Router<AppState> {
    let mut router = Router::new()
        .route("/authorize", get(authorize))
        .route("/token", post(token))
        .route("/register", post(register))
        .route("/auth/callback", get(idp_callback))
        .route("/signin", get(signin));

    let mut suffixes = vec![String::new()];
    suffixes.extend(mcp_routes.iter().map(|route| route.route.clone()));
    for suffix in &suffixes {
        router = router
            .route(
                &format!("/.well-known/oauth-authorization-server{suffix}"),
                get(authorization_server_metadata),
            )
            .route(
                &format!("/.well-known/oauth-protected-resource{suffix}"),
                get(protected_resource_metadata),
            );
    }
    router
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeParams {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub response_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub code_challenge: Option<String>,
    #[serde(default)]
    pub code_challenge_method: Option<String>,
}

async fn authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeParams>,
) -> GatewayResult<Redirect> {
    let origin = request_origin(&headers, &state.config.gateway_origin);
    let providers = state.oauth.provider_set(&origin);
    if providers.is_empty() {
        return Err(GatewayError::AuthProviderUnconfigured(
            "no third-party OAuth providers configured".into(),
        ));
    }
    state
        .oauth
        .validate_client_redirect(&params.client_id, &params.redirect_uri)?;

    // requested scopes are stripped; the canonical scope set applies
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for provider in providers.iter() {
        let provider_url = provider.authorize(
            &params.client_id,
            &params.redirect_uri,
            params.state.as_deref(),
        )?;
        query.append_pair(&format!("{}_url", provider.name()), &provider_url);
    }

    Ok(Redirect::to(&format!("/signin?{}", query.finish())))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
}

async fn idp_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> GatewayResult<Redirect> {
    if let Some(idp_error) = params.error {
        return Err(GatewayError::AuthTokenInvalid(format!(
            "IdP returned an error: {idp_error}"
        )));
    }
    let txn_id = params
        .state
        .ok_or_else(|| GatewayError::RouteInvalid("IdP callback missing transaction ID".into()))?;
    let code = params
        .code
        .ok_or_else(|| GatewayError::RouteInvalid("IdP callback missing code".into()))?;

    let provider = state
        .oauth
        .find_transaction(&txn_id)
        .ok_or_else(|| GatewayError::RouteInvalid("transaction not found".into()))?;
    let txn = provider
        .take_transaction(&txn_id)
        .ok_or_else(|| GatewayError::RouteInvalid("transaction not found".into()))?;

    state
        .oauth
        .remember_client_provider(&txn.client_id, provider.clone());

    let redirect = provider.handle_callback(txn, &code).await?;
    Ok(Redirect::to(&redirect))
}

async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> GatewayResult<Json<OAuthTokenResponse>> {
    let client_id = form
        .get("client_id")
        .cloned()
        .or_else(|| basic_auth_client_id(&headers))
        .ok_or_else(|| GatewayError::AuthTokenInvalid("missing client_id".into()))?;
    let grant_type = form
        .get("grant_type")
        .map(String::as_str)
        .unwrap_or("authorization_code");

    let provider = state.oauth.provider_for_client(&client_id)?;
    match grant_type {
        "authorization_code" => {
            let code = form
                .get("code")
                .ok_or_else(|| GatewayError::AuthTokenInvalid("missing code".into()))?;
            Ok(Json(provider.exchange_code(&client_id, code)?))
        }
        "refresh_token" => {
            let refresh_token = form
                .get("refresh_token")
                .ok_or_else(|| GatewayError::AuthTokenInvalid("missing refresh_token".into()))?;
            Ok(Json(provider.exchange_refresh_token(refresh_token).await?))
        }
        other => Err(GatewayError::RouteInvalid(format!(
            "unsupported grant_type: {other}"
        ))),
    }
}

fn basic_auth_client_id(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    decoded.split(':').next().map(str::to_string)
}

#[derive(Debug, Deserialize)]
pub struct ClientRegistrationRequest {
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub client_name: Option<String>,
}

/// Dynamic client registration.
async fn register(
    State(state): State<AppState>,
    Json(request): Json<ClientRegistrationRequest>,
) -> impl IntoResponse {
    let client = state
        .oauth
        .register_client(request.redirect_uris, request.client_name);
    info!(client_id = %client.client_id, "registered OAuth client");

    (
        StatusCode::CREATED,
        Json(json!({
            "client_id": client.client_id,
            "client_secret": client.client_secret,
            "redirect_uris": client.redirect_uris,
            "client_name": client.client_name,
            "scope": client.scope,
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "token_endpoint_auth_method": "client_secret_post",
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct SigninParams {
    pub github_url: Option<String>,
    pub google_url: Option<String>,
}

/// Page letting the human pick an authentication provider.
async fn signin(Query(params): Query<SigninParams>) -> Response {
    if params.github_url.is_none() && params.google_url.is_none() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "No authentication providers configured",
        )
            .into_response();
    }

    let mut options = String::new();
    if let Some(url) = &params.github_url {
        options.push_str(&format!(
            r#"<p><a href="{}">Continue with GitHub</a></p>"#,
            html_escape(url)
        ));
    }
    if let Some(url) = &params.google_url {
        options.push_str(&format!(
            r#"<p><a href="{}">Continue with Google</a></p>"#,
            html_escape(url)
        ));
    }

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Sign in</title></head>
<body>
<h1>Sign in</h1>
{options}
</body>
</html>"#
    ))
    .into_response()
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

async fn authorization_server_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let origin = request_origin(&headers, &state.config.gateway_origin);
    Json(json!({
        "issuer": origin,
        "authorization_endpoint": format!("{origin}/authorize"),
        "token_endpoint": format!("{origin}/token"),
        "registration_endpoint": format!("{origin}/register"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "token_endpoint_auth_methods_supported": ["client_secret_post", "client_secret_basic", "none"],
        "code_challenge_methods_supported": ["S256"],
        "scopes_supported": OAUTH_SCOPES,
    }))
}

async fn protected_resource_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let origin = request_origin(&headers, &state.config.gateway_origin);
    Json(json!({
        "resource": origin,
        "authorization_servers": [origin],
        "scopes_supported": OAUTH_SCOPES,
        "bearer_methods_supported": ["header"],
    }))
}
