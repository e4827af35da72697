//! Gateway configuration.
//!
//! Priority: environment variables (with `.env` support) over defaults.
//! Missing required settings are fatal at startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use engine::settings::{ContainerSettings, EngineKind};

use crate::error::{GatewayError, GatewayResult};

/// Active-pool TTL bounds: default 10 minutes, configurable up to 20.
pub const DEFAULT_ACTIVE_TTL_SECONDS: u64 = 60 * 10;
pub const MAX_ACTIVE_TTL_SECONDS: u64 = 60 * 20;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub origin: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub git_rev: String,

    pub gateway_origin: String,
    pub extra_origins: Vec<String>,
    pub port: u16,

    pub admin_api_token: String,
    pub admin_email_domain: String,

    pub container_engine: EngineKind,
    pub data_dir: PathBuf,
    pub container_project_name: String,
    pub container_subnet_prefix: String,
    pub num_standby_containers: usize,
    pub max_num_running_containers: usize,
    pub container_active_ttl_seconds: u64,

    pub browser_timeout: u64,
    pub default_proxy_type: Option<String>,
    /// Inline TOML document describing the available egress proxies.
    pub proxies_config: Option<String>,

    pub oauth_github_client_id: String,
    pub oauth_github_client_secret: String,
    pub oauth_google_client_id: String,
    pub oauth_google_client_secret: String,

    /// app key → app name; users of these apps are one-time.
    pub getgather_apps: HashMap<String, String>,
    /// app key → app name; users of these apps are persistent.
    pub getgather_persistent_apps: HashMap<String, String>,

    pub proxy_timeout_secs: u64,
    pub proxy_read_timeout_secs: u64,
}

impl Config {
    pub fn load() -> GatewayResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> GatewayResult<Self> {
        Ok(Self {
            log_level: env_string("LOG_LEVEL", "INFO"),
            git_rev: env_string("GIT_REV", ""),
            gateway_origin: env_string("GATEWAY_ORIGIN", ""),
            extra_origins: env_list("EXTRA_ORIGINS"),
            port: env_parse("PORT", 9000),
            admin_api_token: env_string("ADMIN_API_TOKEN", ""),
            admin_email_domain: env_string("ADMIN_EMAIL_DOMAIN", ""),
            container_engine: EngineKind::parse(&env_string("CONTAINER_ENGINE", "docker"))
                .ok_or_else(|| {
                    GatewayError::Config("CONTAINER_ENGINE must be docker or podman".into())
                })?,
            data_dir: PathBuf::from(env_string("DATA_DIR", "data")),
            container_project_name: env_string("CONTAINER_PROJECT_NAME", "getgather"),
            container_subnet_prefix: env_string("CONTAINER_SUBNET_PREFIX", "10.89.0"),
            num_standby_containers: env_parse("NUM_STANDBY_CONTAINERS", 2),
            max_num_running_containers: env_parse("MAX_NUM_RUNNING_CONTAINERS", 50),
            container_active_ttl_seconds: env_parse(
                "CONTAINER_ACTIVE_TTL_SECONDS",
                DEFAULT_ACTIVE_TTL_SECONDS,
            ),
            browser_timeout: env_parse("BROWSER_TIMEOUT", 30_000),
            default_proxy_type: env_opt("DEFAULT_PROXY_TYPE"),
            proxies_config: env_opt("PROXIES_CONFIG"),
            oauth_github_client_id: env_string("OAUTH_GITHUB_CLIENT_ID", ""),
            oauth_github_client_secret: env_string("OAUTH_GITHUB_CLIENT_SECRET", ""),
            oauth_google_client_id: env_string("OAUTH_GOOGLE_CLIENT_ID", ""),
            oauth_google_client_secret: env_string("OAUTH_GOOGLE_CLIENT_SECRET", ""),
            getgather_apps: env_json_map("GETGATHER_APPS")?,
            getgather_persistent_apps: env_json_map("GETGATHER_PERSISTENT_APPS")?,
            proxy_timeout_secs: env_parse("PROXY_TIMEOUT", 10),
            proxy_read_timeout_secs: env_parse("PROXY_READ_TIMEOUT", 300),
        })
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.gateway_origin.is_empty() {
            return Err(GatewayError::Config("GATEWAY_ORIGIN is required".into()));
        }
        if url::Url::parse(&self.gateway_origin).is_err() {
            return Err(GatewayError::Config(format!(
                "GATEWAY_ORIGIN is not a valid origin: {}",
                self.gateway_origin
            )));
        }
        for origin in &self.extra_origins {
            if url::Url::parse(origin).is_err() {
                return Err(GatewayError::Config(format!(
                    "EXTRA_ORIGINS entry is not a valid origin: {origin}"
                )));
            }
        }
        if self.num_standby_containers == 0 {
            return Err(GatewayError::Config(
                "NUM_STANDBY_CONTAINERS must be >= 1".into(),
            ));
        }
        if self.container_active_ttl_seconds == 0
            || self.container_active_ttl_seconds > MAX_ACTIVE_TTL_SECONDS
        {
            return Err(GatewayError::Config(format!(
                "CONTAINER_ACTIVE_TTL_SECONDS must be within 1..={MAX_ACTIVE_TTL_SECONDS}"
            )));
        }
        Ok(())
    }

    /// All configured origins, the primary first.
    pub fn origins(&self) -> Vec<String> {
        let mut origins = vec![self.gateway_origin.clone()];
        origins.extend(self.extra_origins.iter().cloned());
        origins
    }

    /// One HTTP listener per configured origin. The port comes from the
    /// origin URL when explicit, otherwise from `PORT`.
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        self.origins()
            .into_iter()
            .map(|origin| ServerConfig {
                port: port_for_origin(&origin).unwrap_or(self.port),
                origin,
            })
            .collect()
    }

    /// Scheme and host of the primary origin, used for forwarded headers.
    pub fn origin_parts(&self) -> (String, String) {
        match url::Url::parse(&self.gateway_origin) {
            Ok(parsed) => {
                let host = match (parsed.host_str(), parsed.port()) {
                    (Some(host), Some(port)) => format!("{host}:{port}"),
                    (Some(host), None) => host.to_string(),
                    _ => self.gateway_origin.clone(),
                };
                (parsed.scheme().to_string(), host)
            }
            Err(_) => ("http".to_string(), self.gateway_origin.clone()),
        }
    }

    pub fn container_settings(&self) -> ContainerSettings {
        ContainerSettings {
            engine: self.container_engine,
            project_name: self.container_project_name.clone(),
            data_dir: self.data_dir.clone(),
            subnet_prefix: self.container_subnet_prefix.clone(),
            num_standby: self.num_standby_containers,
            active_ttl: Duration::from_secs(self.container_active_ttl_seconds),
            max_running: self.max_num_running_containers,
            gateway_origin: self.gateway_origin.clone(),
            log_level: self.log_level.clone(),
            browser_timeout: self.browser_timeout,
            default_proxy_type: self.default_proxy_type.clone(),
            proxies_file: self.data_dir.join("proxies.yaml"),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// `GETGATHER_APPS`-style maps are inline JSON objects.
fn env_json_map(key: &str) -> GatewayResult<HashMap<String, String>> {
    match env_opt(key) {
        None => Ok(HashMap::new()),
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|error| GatewayError::Config(format!("{key} is not a JSON map: {error}"))),
    }
}

fn port_for_origin(origin: &str) -> Option<u16> {
    url::Url::parse(origin).ok()?.port()
}

#[cfg(test)]
pub(crate) fn test_config(data_dir: &std::path::Path) -> Config {
    Config {
        log_level: "INFO".into(),
        git_rev: "deadbeef".into(),
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
        container_active_ttl_seconds: DEFAULT_ACTIVE_TTL_SECONDS,
        browser_timeout: 30_000,
        default_proxy_type: None,
        proxies_config: None,
        oauth_github_client_id: "gh-client".into(),
        oauth_github_client_secret: "gh-secret".into(),
        oauth_google_client_id: "goog-client".into(),
        oauth_google_client_secret: "goog-secret".into(),
        getgather_apps: HashMap::from([("testapp".to_string(), "Test App".to_string())]),
        getgather_persistent_apps: HashMap::from([(
            "keeper".to_string(),
            "Keeper App".to_string(),
        )]),
        proxy_timeout_secs: 10,
        proxy_read_timeout_secs: 300,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_origin() {
        let dir = std::env::temp_dir();
        let mut config = test_config(&dir);
        config.gateway_origin = String::new();
        assert!(config.validate().is_err());

        config.gateway_origin = "not a url".into();
        assert!(config.validate().is_err());

        config.gateway_origin = "https://gw.example.com".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_bounds_ttl() {
        let dir = std::env::temp_dir();
        let mut config = test_config(&dir);
        config.container_active_ttl_seconds = MAX_ACTIVE_TTL_SECONDS + 1;
        assert!(config.validate().is_err());
        config.container_active_ttl_seconds = MAX_ACTIVE_TTL_SECONDS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_configs_port_resolution() {
        let dir = std::env::temp_dir();
        let mut config = test_config(&dir);
        config.extra_origins = vec!["https://alt.example.com:8443".into()];

        let servers = config.server_configs();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].port, 9000); // explicit in origin URL
        assert_eq!(servers[1].port, 8443);
    }

    #[test]
    fn test_origin_parts() {
        let dir = std::env::temp_dir();
        let config = test_config(&dir);
        let (proto, host) = config.origin_parts();
        assert_eq!(proto, "http");
        assert_eq!(host, "localhost:9000");
    }

    #[test]
    fn test_container_settings_projection() {
        let dir = std::env::temp_dir();
        let config = test_config(&dir);
        let settings = config.container_settings();
        assert_eq!(settings.num_standby, 2);
        assert_eq!(settings.network_name(), "getgather_internal-net");
        assert_eq!(settings.active_ttl, Duration::from_secs(600));
    }
}
