//! Shared fixtures for router and handler tests.

use std::sync::Arc;

use dashmap::DashMap;
use engine::fake::FakeEngine;
use engine::manager::ContainerManager;
use engine::service::ContainerService;

use crate::auth::oauth::MultiOAuthProvider;
use crate::auth::token::TokenRouter;
use crate::config::test_config;
use crate::proxies::mcp::McpRoute;
use crate::routes::account::ACCOUNT_CLIENT_ID;
use crate::state::AppState;

pub(crate) struct TestContext {
    // keeps the data dir alive for the duration of the test
    #[allow(dead_code)]
    pub dir: tempfile::TempDir,
    pub state: AppState,
    pub engine: Arc<FakeEngine>,
}

pub(crate) async fn test_state() -> TestContext {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path()));
    let settings = Arc::new(config.container_settings());

    let engine = Arc::new(FakeEngine::new(settings.network_name()));
    let service = Arc::new(ContainerService::new(engine.clone(), settings.clone()));
    let manager = ContainerManager::with_capacity(service, settings.clone(), 4);

    let http = reqwest::Client::new();
    let oauth = Arc::new(MultiOAuthProvider::from_config(&config, http.clone()));
    oauth.register_internal_client(
        ACCOUNT_CLIENT_ID,
        vec![format!("{}/client/auth/callback", config.gateway_origin)],
    );
    let token_router = Arc::new(TokenRouter::new(
        config.getgather_apps.clone(),
        config.getgather_persistent_apps.clone(),
    ));

    let state = AppState {
        config,
        settings,
        manager,
        oauth,
        token_router,
        http,
        mcp_routes: Arc::new(vec![McpRoute {
            name: "media".into(),
            route: "/mcp-media".into(),
        }]),
        account_flows: Arc::new(DashMap::new()),
    };

    TestContext { dir, state, engine }
}
