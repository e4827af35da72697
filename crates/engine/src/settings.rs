//! Container-side settings shared by the service and manager.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Seconds a freshly created container needs before it is routable.
pub const CONTAINER_STARTUP_SECONDS: i64 = 20;

/// Upstream image pulled by `/admin/reload` and retagged locally.
pub const UPSTREAM_IMAGE: &str = "ghcr.io/mcp-getgather/mcp-getgather:latest";

pub const CONTAINER_SERVICE_NAME: &str = "mcp-getgather";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Docker,
    Podman,
}

impl EngineKind {
    pub fn program(&self) -> &'static str {
        match self {
            EngineKind::Docker => "docker",
            EngineKind::Podman => "podman",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "docker" => Some(EngineKind::Docker),
            "podman" => Some(EngineKind::Podman),
            _ => None,
        }
    }

    /// Engine socket path, OS dependent (system path on Linux, per-user
    /// path on macOS). Exported as `DOCKER_HOST` / `CONTAINER_HOST`.
    pub fn socket(&self) -> String {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        let path = match (self, cfg!(target_os = "macos")) {
            (EngineKind::Docker, true) => format!("{home}/.docker/run/docker.sock"),
            (EngineKind::Docker, false) => "/var/run/docker.sock".to_string(),
            (EngineKind::Podman, true) => {
                format!("{home}/.local/share/containers/podman/machine/podman.sock")
            }
            (EngineKind::Podman, false) => "/run/podman/podman.sock".to_string(),
        };
        format!("unix://{path}")
    }
}

#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub engine: EngineKind,
    pub project_name: String,
    pub data_dir: PathBuf,
    pub subnet_prefix: String,
    pub num_standby: usize,
    pub active_ttl: Duration,
    pub max_running: usize,
    pub gateway_origin: String,
    pub log_level: String,
    pub browser_timeout: u64,
    pub default_proxy_type: Option<String>,
    /// Host path of the read-only egress proxy config bound into workers.
    pub proxies_file: PathBuf,
}

impl ContainerSettings {
    /// "internal-net" is the network name used in docker-compose.yml;
    /// the full network name is prefixed by the compose project name.
    pub fn network_name(&self) -> String {
        format!("{}_internal-net", self.project_name)
    }

    pub fn image_name(&self) -> String {
        format!("{}_{}", self.project_name, CONTAINER_SERVICE_NAME)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "com.docker.compose.project".to_string(),
                self.project_name.clone(),
            ),
            (
                "com.docker.compose.service".to_string(),
                CONTAINER_SERVICE_NAME.to_string(),
            ),
        ])
    }

    pub fn mount_root(&self) -> PathBuf {
        self.data_dir.join("container_mounts")
    }

    /// Quarantine directory for purged mounts, kept for investigation.
    pub fn cleanup_dir(&self) -> PathBuf {
        self.mount_root().join("__cleanup")
    }

    /// Mount directory name is the same as the hostname.
    pub fn mount_dir(&self, hostname: &str) -> PathBuf {
        self.mount_root().join(hostname)
    }

    pub fn metadata_file(&self, hostname: &str) -> PathBuf {
        self.mount_dir(hostname).join("metadata.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// IP of the tailscale router used by containers to reach the
    /// residential proxy service.
    pub fn tailscale_router_ip(&self) -> String {
        format!("{}.2", self.subnet_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ContainerSettings {
        ContainerSettings {
            engine: EngineKind::Podman,
            project_name: "getgather".into(),
            data_dir: PathBuf::from("/srv/data"),
            subnet_prefix: "10.89.0".into(),
            num_standby: 2,
            active_ttl: Duration::from_secs(600),
            max_running: 50,
            gateway_origin: "https://gw.example.com".into(),
            log_level: "INFO".into(),
            browser_timeout: 30_000,
            default_proxy_type: None,
            proxies_file: PathBuf::from("/srv/proxies.yaml"),
        }
    }

    #[test]
    fn test_derived_names() {
        let settings = settings();
        assert_eq!(settings.network_name(), "getgather_internal-net");
        assert_eq!(settings.image_name(), "getgather_mcp-getgather");
        assert_eq!(settings.tailscale_router_ip(), "10.89.0.2");
    }

    #[test]
    fn test_mount_layout() {
        let settings = settings();
        assert_eq!(
            settings.mount_dir("abc234"),
            PathBuf::from("/srv/data/container_mounts/abc234")
        );
        assert_eq!(
            settings.metadata_file("abc234"),
            PathBuf::from("/srv/data/container_mounts/abc234/metadata.json")
        );
        assert_eq!(
            settings.cleanup_dir(),
            PathBuf::from("/srv/data/container_mounts/__cleanup")
        );
    }

    #[test]
    fn test_engine_kind_parse() {
        assert_eq!(EngineKind::parse("docker"), Some(EngineKind::Docker));
        assert_eq!(EngineKind::parse("podman"), Some(EngineKind::Podman));
        assert_eq!(EngineKind::parse("containerd"), None);
    }
}
