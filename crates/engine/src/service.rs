//! Stateless operations on a single container.
//!
//! === Containers ===
//! - Workers run the `{project}_mcp-getgather` image in the same network
//!   as the gateway.
//! - Identifiers:
//!   - `id`: assigned by the engine, changes after re-create / restart.
//!   - `hostname`: the unique identifier of the container through its whole
//!     lifecycle, generated at creation. Also the host mount directory name
//!     for `/app/data`.
//!   - `name`: `UNASSIGNED-{hostname}` for standby containers and
//!     `{user_id}-{hostname}` for assigned ones.
//! - Containers can be searched by user id or hostname since both are
//!   unique substrings of the name.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{info, warn};

use crate::container::Container;
use crate::error::{EngineError, EngineResult};
use crate::identity::{ContainerIdentity, UNASSIGNED_USER_ID};
use crate::lock::{EngineLock, EngineSession};
use crate::metadata::ContainerMetadata;
use crate::ops::{ContainerSpec, EngineOps, ListFilter};
use crate::settings::{ContainerSettings, CONTAINER_STARTUP_SECONDS, UPSTREAM_IMAGE};
use crate::user::AuthUser;

/// Hostname alphabet: lowercase alphanumerics minus easily-confused
/// characters, safe for DNS names and file paths.
pub const FRIENDLY_CHARS: &[u8] = b"23456789abcdefghijkmnpqrstuvwxyz";
pub const HOSTNAME_LEN: usize = 6;

pub struct ContainerService {
    engine: Arc<dyn EngineOps>,
    lock: EngineLock,
    settings: Arc<ContainerSettings>,
}

impl ContainerService {
    pub fn new(engine: Arc<dyn EngineOps>, settings: Arc<ContainerSettings>) -> Self {
        Self {
            engine,
            lock: EngineLock::new(),
            settings,
        }
    }

    pub fn lock(&self) -> &EngineLock {
        &self.lock
    }

    pub fn engine(&self) -> &Arc<dyn EngineOps> {
        &self.engine
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    fn filter(&self, partial_name: Option<&str>) -> ListFilter {
        let mut filter = ListFilter::default().with_labels(self.settings.labels());
        filter.partial_name = partial_name.map(str::to_string);
        filter
    }

    /// A container is routable once it has been running past its warm-up
    /// window.
    pub fn is_container_ready(container: &Container) -> bool {
        container.is_running()
            && Utc::now() > container.started_at + ChronoDuration::seconds(CONTAINER_STARTUP_SECONDS)
    }

    pub async fn get_containers(
        &self,
        session: &EngineSession,
        partial_name: Option<&str>,
        only_ready: bool,
    ) -> EngineResult<Vec<Container>> {
        let mut containers = self.engine.list(session, &self.filter(partial_name)).await?;
        if only_ready {
            containers.retain(Self::is_container_ready);
        }
        Ok(containers)
    }

    pub async fn get_container(
        &self,
        session: &EngineSession,
        partial_name: &str,
    ) -> EngineResult<Option<Container>> {
        let mut containers = self
            .get_containers(session, Some(partial_name), false)
            .await?;
        match containers.len() {
            0 => Ok(None),
            1 => Ok(Some(containers.remove(0))),
            _ => Err(EngineError::AmbiguousName(partial_name.to_string())),
        }
    }

    /// Random selection (not FIFO) avoids pathological sequential
    /// reassignment when a single hostname repeatedly fails.
    pub async fn get_random_unassigned_container(
        &self,
        session: &EngineSession,
    ) -> EngineResult<Container> {
        let containers = self
            .get_containers(session, Some(UNASSIGNED_USER_ID), true)
            .await?;
        let container = containers
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(EngineError::NoStandby)?;
        info!(container = %container.name, "randomly selected unassigned container");
        Ok(container)
    }

    pub async fn assign_container(
        &self,
        session: &EngineSession,
        user: &AuthUser,
    ) -> EngineResult<Container> {
        session.require_write()?;

        // a racing request for the same user may have assigned a container
        // while we waited on the writer lock
        if let Some(existing) = self.get_container(session, &user.user_id()).await? {
            info!(
                container = %existing.name,
                user_id = %user.user_id(),
                "user already has a container, reusing"
            );
            return Ok(existing);
        }

        let standby = self.get_random_unassigned_container(session).await?;
        let assigned_name =
            ContainerIdentity::for_user(&standby.hostname, user.clone()).container_name();
        self.engine
            .rename(session, &standby.id, &assigned_name)
            .await?;

        let container = self.engine.get_by_id(session, &standby.id).await?;
        self.write_metadata(&container, user).await?;

        info!(
            container = %container.name,
            user_id = %user.user_id(),
            "container assigned to user"
        );
        Ok(container)
    }

    /// Delete a container and move its mount directory to the quarantine
    /// directory for later investigation.
    pub async fn purge_container(
        &self,
        session: &EngineSession,
        container: &Container,
    ) -> EngineResult<()> {
        session.require_write()?;
        self.engine
            .delete(session, &[container.id.clone()])
            .await?;

        let src = self.settings.mount_dir(&container.hostname);
        let dst = self.settings.cleanup_dir().join(&container.hostname);
        tokio::fs::create_dir_all(self.settings.cleanup_dir()).await?;
        match tokio::fs::rename(&src, &dst).await {
            Ok(()) => info!(
                container = %container.name,
                cleanup_dir = %dst.display(),
                "purged container and quarantined its mount dir"
            ),
            Err(error) => warn!(
                container = %container.name,
                %error,
                "purged container but its mount dir could not be moved"
            ),
        }
        Ok(())
    }

    /// Disconnect the internal network first so the restore can re-attach
    /// with a fresh IP.
    pub async fn checkpoint_container(
        &self,
        session: &EngineSession,
        container: &Container,
    ) -> EngineResult<Container> {
        session.require_write()?;
        if !self.engine.capabilities().checkpoint {
            return Err(EngineError::Unsupported {
                operation: "checkpoint",
            });
        }
        self.engine.disconnect_network(session, &container.id).await?;
        self.engine.checkpoint(session, &container.id).await?;

        let refreshed = self.engine.get_by_id(session, &container.id).await?;
        info!(container = %refreshed.name, "checkpointed container");
        Ok(refreshed)
    }

    pub async fn restore_container(
        &self,
        session: &EngineSession,
        container: &Container,
    ) -> EngineResult<Container> {
        session.require_write()?;
        if !self.engine.capabilities().checkpoint {
            return Err(EngineError::Unsupported {
                operation: "restore",
            });
        }
        self.engine.restore(session, &container.id).await?;
        self.engine.connect_network(session, &container.id).await?;

        let refreshed = self.engine.get_by_id(session, &container.id).await?;
        info!(container = %refreshed.name, "restored container");
        Ok(refreshed)
    }

    /// Create a fresh standby container, or re-create an existing one from
    /// its mount directory.
    pub async fn create_or_replace_container(
        &self,
        session: &EngineSession,
        mount_dir: Option<&Path>,
    ) -> EngineResult<Container> {
        session.require_write()?;

        let (hostname, user) = match mount_dir {
            None => (self.generate_hostname()?, None),
            Some(dir) => {
                let hostname = dir
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or_else(|| {
                        EngineError::Parse(format!("invalid mount dir: {}", dir.display()))
                    })?
                    .to_string();
                let user = self
                    .read_metadata(&hostname)
                    .await?
                    .map(|metadata| metadata.user);
                (hostname, user)
            }
        };

        let identity = match user {
            Some(user) => ContainerIdentity::for_user(&hostname, user),
            None => ContainerIdentity::unassigned(&hostname),
        };

        tokio::fs::create_dir_all(self.settings.mount_dir(&hostname)).await?;

        let spec = self.container_spec(&identity);
        let container = self.engine.create_or_replace(session, &spec).await?;
        info!(container = %container.name, "created or reloaded container");
        Ok(container)
    }

    fn container_spec(&self, identity: &ContainerIdentity) -> ContainerSpec {
        let settings = &self.settings;
        let mount_dir = settings.mount_dir(&identity.hostname);

        let mut envs = std::collections::BTreeMap::from([
            ("ENVIRONMENT".to_string(), settings.gateway_origin.clone()),
            ("LOG_LEVEL".to_string(), settings.log_level.clone()),
            ("HOSTNAME".to_string(), identity.hostname.clone()),
            (
                "BROWSER_TIMEOUT".to_string(),
                settings.browser_timeout.to_string(),
            ),
            ("DATA_DIR".to_string(), "/app/data".to_string()),
            ("PORT".to_string(), "80".to_string()),
        ]);
        if let Some(default_proxy_type) = &settings.default_proxy_type {
            envs.insert("DEFAULT_PROXY_TYPE".to_string(), default_proxy_type.clone());
        }

        let mut cap_adds = vec!["NET_BIND_SERVICE".to_string()];
        let mut entrypoint = None;
        let mut cmd = Vec::new();

        // Off macOS the container reaches the residential proxy service
        // through the tailscale router, which needs a static route and
        // NET_ADMIN.
        if !cfg!(target_os = "macos") {
            entrypoint = Some("/bin/sh".to_string());
            cmd = vec![
                "-c".to_string(),
                format!(
                    "ip route add 100.64.0.0/10 via {} && exec /app/entrypoint.sh",
                    settings.tailscale_router_ip()
                ),
            ];
            cap_adds.push("NET_ADMIN".to_string());
        }

        ContainerSpec {
            name: identity.container_name(),
            hostname: identity.hostname.clone(),
            user: "root".to_string(),
            image: settings.image_name(),
            entrypoint,
            cmd,
            envs,
            volumes: vec![
                format!("{}:/app/data:rw", mount_dir.display()),
                format!("{}:/app/proxies.yaml:ro", settings.proxies_file.display()),
            ],
            labels: settings.labels(),
            cap_adds,
        }
    }

    /// Generate a random hostname until it collides with no existing
    /// mount directory.
    pub fn generate_hostname(&self) -> EngineResult<String> {
        let mount_root = self.settings.mount_root();
        std::fs::create_dir_all(&mount_root)?;

        let existing: HashSet<String> = std::fs::read_dir(&mount_root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();

        let mut rng = rand::thread_rng();
        loop {
            let hostname: String = (0..HOSTNAME_LEN)
                .map(|_| FRIENDLY_CHARS[rng.gen_range(0..FRIENDLY_CHARS.len())] as char)
                .collect();
            if !existing.contains(&hostname) {
                return Ok(hostname);
            }
        }
    }

    pub async fn identity_for_hostname(&self, hostname: &str) -> EngineResult<ContainerIdentity> {
        match self.read_metadata(hostname).await? {
            Some(metadata) => Ok(ContainerIdentity::for_user(hostname, metadata.user)),
            None => Ok(ContainerIdentity::unassigned(hostname)),
        }
    }

    pub async fn read_metadata(&self, hostname: &str) -> EngineResult<Option<ContainerMetadata>> {
        ContainerMetadata::read(&self.settings.metadata_file(hostname)).await
    }

    async fn write_metadata(&self, container: &Container, user: &AuthUser) -> EngineResult<()> {
        let metadata = ContainerMetadata { user: user.clone() };
        metadata
            .write(&self.settings.metadata_file(&container.hostname))
            .await
    }

    /// Pull the upstream image and retag it to the local image name used
    /// by `create_or_replace_container`.
    pub async fn pull_container_image(&self, session: &EngineSession) -> EngineResult<()> {
        info!(source = UPSTREAM_IMAGE, "pulling container image");
        self.engine
            .pull_image(session, UPSTREAM_IMAGE, Some(&self.settings.image_name()))
            .await
    }
}
