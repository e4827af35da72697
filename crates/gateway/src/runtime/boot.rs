//! Boot — logging init, config load, engine connection, pool recovery,
//! and MCP route discovery.

use std::sync::Arc;

use anyhow::Context;
use dashmap::DashMap;
use engine::client::CliEngineClient;
use engine::manager::ContainerManager;
use engine::ops::EngineOps;
use engine::service::ContainerService;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::auth::oauth::MultiOAuthProvider;
use crate::auth::token::TokenRouter;
use crate::config::Config;
use crate::proxies::mcp::discover_mcp_routes;
use crate::routes::account::ACCOUNT_CLIENT_ID;
use crate::state::AppState;

/// Phase 1: basic tracing so config loading can log. Thread-local so the
/// configured subscriber can replace it.
pub fn init_tracing_basic() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,gateway=debug"));
    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_default(subscriber)
}

/// Phase 2: the configured subscriber. Stdout gets everything at the
/// configured level; container-lifecycle events (manager and service
/// targets) are additionally written as JSON to
/// `{data_dir}/logs/containers.log`.
pub fn init_tracing(config: &Config) -> anyhow::Result<()> {
    use tracing_subscriber::{filter, fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_lowercase()));

    let stdout_layer = fmt::layer().with_target(true);

    let logs_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("failed to create logs dir: {}", logs_dir.display()))?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join("containers.log"))
        .context("failed to open containers.log")?;

    let file_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_ansi(false)
        .with_writer(Arc::new(log_file))
        .with_filter(filter::filter_fn(|metadata| {
            let target = metadata.target();
            target.starts_with("engine::manager") || target.starts_with("engine::service")
        }));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    Ok(())
}

/// Build the shared state: engine client, container pools (recovered from
/// whatever is already running), OAuth façade, and the MCP route table.
pub async fn boot(config: Config) -> anyhow::Result<AppState> {
    let config = Arc::new(config);
    let settings = Arc::new(config.container_settings());

    std::fs::create_dir_all(settings.mount_root())
        .context("failed to create container mounts dir")?;

    let engine_client: Arc<dyn EngineOps> = Arc::new(CliEngineClient::new(
        settings.engine,
        settings.network_name(),
    ));
    if !engine_client.capabilities().checkpoint {
        warn!(
            "engine cannot checkpoint; persistent containers survive inactivity only while \
             the gateway is up"
        );
    }

    let service = Arc::new(ContainerService::new(engine_client, settings.clone()));
    let manager = ContainerManager::new(service, settings.clone());

    manager
        .init_active_assigned_pool()
        .await
        .context("failed to re-seed the active pool")?;
    manager
        .refresh_standby_pool()
        .await
        .context("failed to fill the standby pool")?;

    let http = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(std::time::Duration::from_secs(config.proxy_timeout_secs))
        // workers answer their own redirects; the gateway passes them through
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build HTTP client")?;

    let mcp_routes = discover_mcp_routes(&manager, &http)
        .await
        .context("failed to discover MCP routes")?;

    let oauth = Arc::new(MultiOAuthProvider::from_config(&config, http.clone()));
    oauth.register_internal_client(
        ACCOUNT_CLIENT_ID,
        config
            .origins()
            .iter()
            .map(|origin| format!("{origin}/client/auth/callback"))
            .collect(),
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
        mcp_routes: Arc::new(mcp_routes),
        account_flows: Arc::new(DashMap::new()),
    };

    if !state.auth_enabled() {
        warn!("MCP authentication is disabled: no OAuth providers or first-party apps configured");
    }
    info!("gateway state initialized");
    Ok(state)
}
