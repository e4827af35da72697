//! Shared application state.

use std::sync::Arc;

use dashmap::DashMap;
use engine::manager::ContainerManager;
use engine::settings::ContainerSettings;
use engine::user::AuthUser;

use crate::auth::oauth::MultiOAuthProvider;
use crate::auth::token::TokenRouter;
use crate::config::Config;
use crate::error::GatewayResult;
use crate::proxies::mcp::McpRoute;
use crate::routes::account::AccountFlow;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub settings: Arc<ContainerSettings>,
    pub manager: Arc<ContainerManager>,
    pub oauth: Arc<MultiOAuthProvider>,
    pub token_router: Arc<TokenRouter>,
    pub http: reqwest::Client,
    pub mcp_routes: Arc<Vec<McpRoute>>,
    pub account_flows: Arc<DashMap<String, AccountFlow>>,
}

impl AppState {
    /// Verify a bearer token against the providers configured for the
    /// requesting origin.
    pub async fn verify_bearer(&self, origin: &str, token: &str) -> GatewayResult<AuthUser> {
        let providers = self.oauth.provider_set(origin);
        self.token_router.verify(&providers, token).await
    }

    pub fn auth_enabled(&self) -> bool {
        self.oauth.enabled() || self.token_router.has_first_party_apps()
    }
}
