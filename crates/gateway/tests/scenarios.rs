//! End-to-end lifecycle scenarios against the in-memory engine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use engine::fake::FakeEngine;
use engine::manager::ContainerManager;
use engine::service::ContainerService;
use engine::settings::EngineKind;
use engine::user::{AuthProvider, AuthUser};

use gateway::auth::oauth::MultiOAuthProvider;
use gateway::auth::token::TokenRouter;
use gateway::config::Config;
use gateway::proxies::mcp::{write_proxies_file, McpRoute};
use gateway::proxy::location::Location;
use gateway::proxy::selector::{
    parse_proxies_toml, select_and_validate, select_entry, EgressProxies,
};
use gateway::routes::account::ACCOUNT_CLIENT_ID;
use gateway::state::AppState;

const TTL: Duration = Duration::from_secs(600);

struct Harness {
    _dir: tempfile::TempDir,
    state: AppState,
    engine: Arc<FakeEngine>,
}

fn config_for(data_dir: &Path) -> Config {
    Config {
        log_level: "INFO".into(),
        git_rev: "test".into(),
        gateway_origin: "http://localhost:9000".into(),
        extra_origins: Vec::new(),
        port: 9000,
        admin_api_token: "admin-secret".into(),
        admin_email_domain: "example.com".into(),
        container_engine: EngineKind::Podman,
        data_dir: data_dir.to_path_buf(),
        container_project_name: "getgather".into(),
        container_subnet_prefix: "10.89.0".into(),
        num_standby_containers: 2,
        max_num_running_containers: 10,
        container_active_ttl_seconds: TTL.as_secs(),
        browser_timeout: 30_000,
        default_proxy_type: None,
        proxies_config: None,
        oauth_github_client_id: "gh-client".into(),
        oauth_github_client_secret: "gh-secret".into(),
        oauth_google_client_id: String::new(),
        oauth_google_client_secret: String::new(),
        getgather_apps: HashMap::from([("app".to_string(), "Test App".to_string())]),
        getgather_persistent_apps: HashMap::new(),
        proxy_timeout_secs: 10,
        proxy_read_timeout_secs: 300,
    }
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(config_for(dir.path()));
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

    // boot sequence: recover the active pool, then fill the standby pool
    state.manager.init_active_assigned_pool().await.unwrap();
    state.manager.refresh_standby_pool().await.unwrap();

    Harness {
        _dir: dir,
        state,
        engine,
    }
}

fn standby_names(engine: &FakeEngine) -> Vec<String> {
    engine
        .container_names()
        .into_iter()
        .filter(|name| name.starts_with("UNASSIGNED-"))
        .collect()
}

/// E1: after boot the standby pool contains exactly `num_standby` running
/// UNASSIGNED containers.
#[tokio::test]
async fn boot_fills_standby_pool() {
    let harness = harness().await;
    let standby = standby_names(&harness.engine);
    assert_eq!(standby.len(), 2);
    for name in &standby {
        let container = harness
            .state
            .manager
            .get_container_by_hostname(name.strip_prefix("UNASSIGNED-").unwrap())
            .await
            .unwrap();
        assert!(container.is_running());
    }
}

/// E2: a first request binds the user to a renamed container, the active
/// pool gains one entry, and the standby pool is refilled.
#[tokio::test]
async fn first_request_assigns_and_refills() {
    let harness = harness().await;
    let user = AuthUser::new("12345", AuthProvider::Github);

    let container = harness.state.manager.get_user_container(&user).await.unwrap();
    assert_eq!(container.name, format!("12345.github-{}", container.hostname));
    assert_eq!(harness.state.manager.active_hostnames().len(), 1);

    for _ in 0..100 {
        harness.state.manager.drain_release_tasks().await;
        if standby_names(&harness.engine).len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(standby_names(&harness.engine).len(), 2);
}

/// E3 + E4: after the TTL a persistent container is checkpointed; the
/// next request restores the same container (same id, same hostname),
/// purging a standby first.
#[tokio::test]
async fn persistent_container_checkpoints_and_restores() {
    let harness = harness().await;
    let user = AuthUser::new("12345", AuthProvider::Github);

    let container = harness.state.manager.get_user_container(&user).await.unwrap();
    // wait for the post-assignment standby refill so the restore has a
    // standby to purge
    for _ in 0..100 {
        harness.state.manager.drain_release_tasks().await;
        if standby_names(&harness.engine).len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    harness
        .state
        .manager
        .expire_active_at(Instant::now() + TTL + Duration::from_secs(1));
    harness.state.manager.drain_release_tasks().await;

    let parked = harness
        .state
        .manager
        .get_container_by_hostname(&container.hostname)
        .await
        .unwrap();
    assert!(parked.checkpointed);
    assert!(!parked.is_running());
    assert!(harness.state.manager.active_hostnames().is_empty());

    let restored = harness.state.manager.get_user_container(&user).await.unwrap();
    assert_eq!(restored.id, container.id);
    assert_eq!(restored.hostname, container.hostname);
    assert!(restored.is_running());

    let calls = harness.engine.calls();
    let purge = calls.iter().rposition(|call| call.starts_with("delete")).unwrap();
    let restore = calls.iter().rposition(|call| call.starts_with("restore")).unwrap();
    assert!(purge < restore, "standby purge must precede the restore");
}

/// E5: a one-time app user's container is purged after the TTL and its
/// mount lands in the quarantine directory; no checkpoint happens.
#[tokio::test]
async fn one_time_container_is_purged_into_quarantine() {
    let harness = harness().await;
    let user = harness
        .state
        .token_router
        .verify_first_party("getgather_app_u42")
        .unwrap();
    assert_eq!(user.auth_provider, AuthProvider::Getgather);

    let container = harness.state.manager.get_user_container(&user).await.unwrap();
    harness.state.manager.drain_release_tasks().await;

    harness
        .state
        .manager
        .expire_active_at(Instant::now() + TTL + Duration::from_secs(1));
    harness.state.manager.drain_release_tasks().await;

    assert!(!harness
        .engine
        .calls()
        .iter()
        .any(|call| call.starts_with("checkpoint")));
    assert!(harness
        .state
        .settings
        .cleanup_dir()
        .join(&container.hostname)
        .exists());
    assert!(!harness
        .state
        .settings
        .mount_dir(&container.hostname)
        .exists());
}

/// E6: a proxy table with hierarchy fields renders a city-level username,
/// passes the probe at some hierarchy level, and lands in proxies.yaml.
#[tokio::test]
async fn egress_proxy_selection_writes_mount_file() {
    let harness = harness().await;

    let toml = r#"
[proxy-0]
name = "oxylabs_direct"
url = "pr.oxylabs.io:7777"
username_template = "customer-{session_id}-cc-{country}-city-{city}-st-{state}"
password = "secret"
hierarchy_fields = ["city", "state"]
"#;
    let proxies = parse_proxies_toml(toml);
    let (_, entry) = select_entry(&proxies, None, None).unwrap();

    let location = Location::from_json(
        r#"{"country":"us","state":"california","city":"los_angeles"}"#,
    )
    .unwrap();

    let resolved = select_and_validate(entry, "abc234", Some(&location), |_, _, _| async {
        Some("3.3.3.3".to_string())
    })
    .await
    .unwrap();
    assert!(resolved
        .username
        .as_deref()
        .unwrap()
        .contains("city-los_angeles"));

    write_proxies_file(
        &harness.state.settings,
        "abc234",
        Some(EgressProxies::from(resolved)),
    )
    .await
    .unwrap();

    let written = std::fs::read_to_string(
        harness.state.settings.mount_dir("abc234").join("proxies.yaml"),
    )
    .unwrap();
    assert!(written.contains("proxy_type: oxylabs_direct"));
    assert!(written.contains("city-los_angeles"));
}

/// E7: two concurrent requests for the same brand-new user end up sharing
/// exactly one assigned container.
#[tokio::test]
async fn concurrent_new_user_requests_share_one_container() {
    let harness = harness().await;
    let user = AuthUser::new("99999", AuthProvider::Google);

    let first_task = {
        let manager = harness.state.manager.clone();
        let user = user.clone();
        tokio::spawn(async move { manager.get_user_container(&user).await })
    };
    let second_task = {
        let manager = harness.state.manager.clone();
        let user = user.clone();
        tokio::spawn(async move { manager.get_user_container(&user).await })
    };

    let first = first_task.await.unwrap().unwrap();
    let second = second_task.await.unwrap().unwrap();
    assert_eq!(first.hostname, second.hostname);

    let assigned = harness
        .engine
        .container_names()
        .iter()
        .filter(|name| name.contains(&user.user_id()))
        .count();
    assert_eq!(assigned, 1);
}

/// The running-count invariant holds while users churn through the pools.
#[tokio::test]
async fn running_count_stays_bounded() {
    let harness = harness().await;

    for index in 0..4 {
        let user = AuthUser::new(format!("user{index}"), AuthProvider::Github);
        harness.state.manager.get_user_container(&user).await.unwrap();
        harness.state.manager.drain_release_tasks().await;
    }

    let total = harness.engine.container_names().len();
    let limit = 2 + 4; // num_standby + active capacity
    assert!(
        total <= limit,
        "expected at most {limit} containers, found {total}"
    );
}
