//! Third-party OAuth providers (GitHub, Google), proxied behind the
//! gateway's own authorization-server surface.
//!
//! Each provider keeps its own pending-transaction table. The gateway
//! never issues tokens of its own for third-party users: the upstream
//! access token is handed to the client and later verified against the
//! provider's userinfo API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use engine::user::{AuthProvider, AuthUser};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::http_utils::token_prefix;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderName {
    Github,
    Google,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Github => "github",
            ProviderName::Google => "google",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn provider_scopes(name: ProviderName) -> Vec<String> {
    match name {
        ProviderName::Github => vec!["user".to_string()],
        ProviderName::Google => vec![
            "openid".to_string(),
            "https://www.googleapis.com/auth/userinfo.email".to_string(),
            "https://www.googleapis.com/auth/userinfo.profile".to_string(),
        ],
    }
}

struct ProviderEndpoints {
    authorize: &'static str,
    token: &'static str,
    userinfo: &'static str,
}

fn endpoints(name: ProviderName) -> ProviderEndpoints {
    match name {
        ProviderName::Github => ProviderEndpoints {
            authorize: "https://github.com/login/oauth/authorize",
            token: "https://github.com/login/oauth/access_token",
            userinfo: "https://api.github.com/user",
        },
        ProviderName::Google => ProviderEndpoints {
            authorize: "https://accounts.google.com/o/oauth2/v2/auth",
            token: "https://oauth2.googleapis.com/token",
            userinfo: "https://openidconnect.googleapis.com/v1/userinfo",
        },
    }
}

/// An in-flight authorization, keyed by the `state` we hand the IdP.
#[derive(Debug, Clone)]
pub struct OAuthTransaction {
    pub txn_id: String,
    pub client_id: String,
    pub client_redirect_uri: String,
    pub client_state: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

struct IssuedCode {
    client_id: String,
    token: OAuthTokenResponse,
}

pub struct OAuthProxyProvider {
    name: ProviderName,
    client_id: String,
    client_secret: String,
    /// Gateway origin this provider instance serves.
    base_url: String,
    http: reqwest::Client,
    transactions: DashMap<String, OAuthTransaction>,
    issued_codes: DashMap<String, IssuedCode>,
}

impl OAuthProxyProvider {
    pub fn new(
        name: ProviderName,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        base_url: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            name,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            base_url: base_url.into(),
            http,
            transactions: DashMap::new(),
            issued_codes: DashMap::new(),
        }
    }

    pub fn name(&self) -> ProviderName {
        self.name
    }

    /// Shared IdP callback path on the gateway origin.
    pub fn callback_url(&self) -> String {
        format!("{}/auth/callback", self.base_url)
    }

    /// Store a transaction for the client and build the IdP authorize URL.
    pub fn authorize(
        &self,
        client_id: &str,
        client_redirect_uri: &str,
        client_state: Option<&str>,
    ) -> GatewayResult<String> {
        let txn_id = Uuid::new_v4().to_string();
        self.transactions.insert(
            txn_id.clone(),
            OAuthTransaction {
                txn_id: txn_id.clone(),
                client_id: client_id.to_string(),
                client_redirect_uri: client_redirect_uri.to_string(),
                client_state: client_state.map(str::to_string),
                created_at: Utc::now(),
            },
        );

        let scopes = provider_scopes(self.name).join(" ");
        let url = Url::parse_with_params(
            endpoints(self.name).authorize,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", &self.callback_url()),
                ("response_type", "code"),
                ("scope", &scopes),
                ("state", &txn_id),
            ],
        )
        .map_err(|error| GatewayError::Config(format!("bad authorize endpoint: {error}")))?;
        Ok(url.to_string())
    }

    pub fn has_transaction(&self, txn_id: &str) -> bool {
        self.transactions.contains_key(txn_id)
    }

    pub fn take_transaction(&self, txn_id: &str) -> Option<OAuthTransaction> {
        self.transactions.remove(txn_id).map(|(_, txn)| txn)
    }

    /// Handle the IdP callback: exchange the IdP code for the upstream
    /// token, mint a one-time local code, and send the client back to its
    /// own redirect URI.
    pub async fn handle_callback(
        &self,
        txn: OAuthTransaction,
        idp_code: &str,
    ) -> GatewayResult<String> {
        let token = self.exchange_idp_code(idp_code).await?;

        let local_code = Uuid::new_v4().to_string();
        self.issued_codes.insert(
            local_code.clone(),
            IssuedCode {
                client_id: txn.client_id.clone(),
                token,
            },
        );

        let mut params: Vec<(&str, &str)> = vec![("code", &local_code)];
        if let Some(state) = txn.client_state.as_deref() {
            params.push(("state", state));
        }
        let redirect = Url::parse_with_params(&txn.client_redirect_uri, &params)
            .map_err(|_| GatewayError::RouteInvalid("bad client redirect uri".into()))?;

        info!(provider = %self.name, client_id = %txn.client_id, "IdP callback completed");
        Ok(redirect.to_string())
    }

    async fn exchange_idp_code(&self, code: &str) -> GatewayResult<OAuthTokenResponse> {
        let response = self
            .http
            .post(endpoints(self.name).token)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", &self.callback_url()),
            ])
            .timeout(EXCHANGE_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::AuthTokenInvalid(format!(
                "{} code exchange failed with {}",
                self.name,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Redeem a local one-time code for the upstream token.
    pub fn exchange_code(&self, client_id: &str, code: &str) -> GatewayResult<OAuthTokenResponse> {
        let (_, issued) = self
            .issued_codes
            .remove(code)
            .ok_or_else(|| GatewayError::AuthTokenInvalid("unknown authorization code".into()))?;
        if issued.client_id != client_id {
            return Err(GatewayError::AuthTokenInvalid(
                "authorization code issued to a different client".into(),
            ));
        }
        Ok(issued.token)
    }

    pub async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> GatewayResult<OAuthTokenResponse> {
        let response = self
            .http
            .post(endpoints(self.name).token)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .timeout(EXCHANGE_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::AuthTokenInvalid(format!(
                "{} token refresh failed with {}",
                self.name,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Verify an upstream access token against the provider's userinfo
    /// API and normalize the claims to an [`AuthUser`].
    pub async fn verify_token(&self, token: &str) -> GatewayResult<AuthUser> {
        let response = self
            .http
            .get(endpoints(self.name).userinfo)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(EXCHANGE_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            warn!(
                provider = %self.name,
                token_prefix = token_prefix(token),
                status = %response.status(),
                "userinfo rejected the token"
            );
            return Err(GatewayError::AuthTokenInvalid(format!(
                "{} rejected the token",
                self.name
            )));
        }

        let claims: serde_json::Value = response.json().await?;
        self.user_from_claims(&claims)
    }

    fn user_from_claims(&self, claims: &serde_json::Value) -> GatewayResult<AuthUser> {
        let (provider, sub) = match self.name {
            ProviderName::Github => (
                AuthProvider::Github,
                claims["id"]
                    .as_i64()
                    .map(|id| id.to_string())
                    .or_else(|| claims["id"].as_str().map(str::to_string)),
            ),
            ProviderName::Google => (
                AuthProvider::Google,
                claims["sub"].as_str().map(str::to_string),
            ),
        };

        // missing sub (or provider, which is fixed here) is a fatal token error
        let sub = sub.ok_or_else(|| {
            GatewayError::AuthTokenInvalid(format!("{} userinfo has no subject", self.name))
        })?;

        let mut user = AuthUser::new(sub, provider);
        user.name = claims["name"].as_str().map(str::to_string);
        user.login = claims["login"].as_str().map(str::to_string);
        user.email = claims["email"].as_str().map(str::to_string);
        Ok(user)
    }
}

/// Providers configured for one gateway origin.
#[derive(Default, Clone)]
pub struct ProviderSet {
    pub github: Option<std::sync::Arc<OAuthProxyProvider>>,
    pub google: Option<std::sync::Arc<OAuthProxyProvider>>,
}

impl ProviderSet {
    pub fn is_empty(&self) -> bool {
        self.github.is_none() && self.google.is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = &std::sync::Arc<OAuthProxyProvider>> {
        self.github.iter().chain(self.google.iter())
    }
}
