//! Stateful container pools and the maintenance loop.
//!
//! Containers fall into these categories:
//! - standby pool: `num_standby` running containers named `UNASSIGNED-*`,
//!   kept warm to hide container-startup latency;
//! - active assigned pool: containers assigned to users, running and not
//!   checkpointed, bounded and TTL-evicted;
//! - checkpointed containers: assigned to persistent users, saved to disk;
//! - error-state containers: anything else (purged on sight).

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::container::{Container, ContainerStatus};
use crate::error::{EngineError, EngineResult};
use crate::identity::UNASSIGNED_USER_ID;
use crate::pool::{PoolCallback, TtlPool};
use crate::service::ContainerService;
use crate::settings::ContainerSettings;
use crate::user::AuthUser;

/// Expected worst-case memory footprint of one worker container.
pub const CONTAINER_MEMORY_BYTES: u64 = 300 * 1024 * 1024;

/// Maximum number of assigned containers that can run simultaneously,
/// using 90% of the host memory, capped by configuration.
pub fn active_pool_size(settings: &ContainerSettings) -> usize {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let by_memory = (system.total_memory() as f64 * 0.9 / CONTAINER_MEMORY_BYTES as f64) as usize;
    let size = by_memory
        .saturating_sub(settings.num_standby)
        .min(settings.max_running)
        .max(1);
    info!(size, "max number of assigned containers in the active pool");
    size
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerInfo {
    pub active_containers: usize,
    pub active_capacity: usize,
    pub ttl_seconds: u64,
}

pub struct ContainerManager {
    service: Arc<ContainerService>,
    settings: Arc<ContainerSettings>,
    active: Mutex<TtlPool<Container>>,
    release_tasks: Mutex<JoinSet<()>>,
}

impl ContainerManager {
    pub fn new(service: Arc<ContainerService>, settings: Arc<ContainerSettings>) -> Arc<Self> {
        Self::with_capacity(service, settings.clone(), active_pool_size(&settings))
    }

    pub fn with_capacity(
        service: Arc<ContainerService>,
        settings: Arc<ContainerSettings>,
        capacity: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let release_callback = |weak: Weak<Self>| -> PoolCallback<Container> {
                Box::new(move |hostname: &str, container: &Container| {
                    let Some(manager) = weak.upgrade() else { return };
                    info!(hostname, "scheduling container release");
                    let container = container.clone();
                    let task_manager = Arc::clone(&manager);
                    manager.release_tasks.lock().spawn(async move {
                        task_manager.release_container(container).await;
                    });
                })
            };

            let pool = TtlPool::new(capacity, settings.active_ttl)
                .with_on_expire(release_callback(weak.clone()))
                .with_on_pop(release_callback(weak.clone()));

            Self {
                service,
                settings,
                active: Mutex::new(pool),
                release_tasks: Mutex::new(JoinSet::new()),
            }
        })
    }

    pub fn service(&self) -> &Arc<ContainerService> {
        &self.service
    }

    pub fn manager_info(&self) -> ManagerInfo {
        let pool = self.active.lock();
        ManagerInfo {
            active_containers: pool.len(),
            active_capacity: pool.maxsize(),
            ttl_seconds: self.settings.active_ttl.as_secs(),
        }
    }

    pub fn active_hostnames(&self) -> Vec<String> {
        self.active.lock().keys().cloned().collect()
    }

    /// Return the container assigned to the user — the central routing
    /// primitive.
    /// - running: refresh its active-pool deadline and return it;
    /// - checkpointed: restore it (purging one standby first);
    /// - error state: purge and fall through;
    /// - none: assign a standby and refill the pool in the background.
    pub async fn get_user_container(self: &Arc<Self>, user: &AuthUser) -> EngineResult<Container> {
        let lock = self.service.lock().clone();

        let mut container = {
            let session = lock.read().await;
            self.service
                .get_container(&session, &user.user_id())
                .await?
        };

        if let Some(found) = container.take() {
            if found.status == ContainerStatus::Running {
                if !self.active.lock().contains(&found.hostname) {
                    warn!(
                        hostname = %found.hostname,
                        user_id = %user.user_id(),
                        "running container was not in the active pool, adding it"
                    );
                }
                container = Some(found);
            } else if found.checkpointed {
                container = Some(self.restore_assigned(&found).await?);
            } else {
                warn!(
                    hostname = %found.hostname,
                    user_id = %user.user_id(),
                    "container is in an error state, a new container will be assigned"
                );
                let session = lock.write().await;
                self.service.purge_container(&session, &found).await?;
                session.finish()?;
            }
        }

        let container = match container {
            Some(container) => container,
            None => {
                let assigned = self.assign_with_refill(user).await?;
                // refill asynchronously so the next caller still finds a
                // warm standby
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(refresh_error) = manager.refresh_standby_pool().await {
                        error!(error = %refresh_error, "standby pool refresh failed");
                    }
                });
                assigned
            }
        };

        self.active
            .lock()
            .insert(container.hostname.clone(), container.clone());
        Ok(container)
    }

    async fn assign_with_refill(&self, user: &AuthUser) -> EngineResult<Container> {
        let lock = self.service.lock().clone();
        {
            let session = lock.write().await;
            match self.service.assign_container(&session, user).await {
                Ok(container) => {
                    session.finish()?;
                    return Ok(container);
                }
                Err(EngineError::NoStandby) => {}
                Err(other) => return Err(other),
            }
        }

        warn!("no standby container available, refilling pool before retry");
        self.refresh_standby_pool().await?;

        let session = lock.write().await;
        let container = self.service.assign_container(&session, user).await?;
        session.finish()?;
        Ok(container)
    }

    /// Restore a checkpointed container. One random standby is purged
    /// first: the restore itself allocates resources, so freeing the slot
    /// must come before it to hold the running-count invariant.
    async fn restore_assigned(&self, container: &Container) -> EngineResult<Container> {
        let lock = self.service.lock().clone();
        let session = lock.write().await;

        match self.service.get_random_unassigned_container(&session).await {
            Ok(standby) => {
                self.service.purge_container(&session, &standby).await?;
            }
            Err(EngineError::NoStandby) => {
                warn!("no standby container to purge before restore");
            }
            Err(other) => return Err(other),
        }

        let restored = self.service.restore_container(&session, container).await?;
        session.finish()?;
        Ok(restored)
    }

    pub async fn get_container_by_hostname(&self, hostname: &str) -> EngineResult<Container> {
        let session = self.service.lock().read().await;
        self.service
            .get_container(&session, hostname)
            .await?
            .ok_or_else(|| EngineError::NotFound(hostname.to_string()))
    }

    pub async fn get_unassigned_container(&self) -> EngineResult<Container> {
        let session = self.service.lock().read().await;
        self.service.get_random_unassigned_container(&session).await
    }

    /// Start any exited standby container and create new ones until the
    /// pool is back at its target size. Creation is sequential: parallel
    /// creates overwhelm the engine and starve inspect calls.
    pub async fn refresh_standby_pool(&self) -> EngineResult<()> {
        let lock = self.service.lock().clone();
        let session = lock.write().await;
        let standby = self
            .service
            .get_containers(&session, Some(UNASSIGNED_USER_ID), false)
            .await?;

        for container in &standby {
            if container.status == ContainerStatus::Exited {
                // standby containers should always be running
                session.capture(self.service.engine().start(&session, &container.id).await);
            }
        }

        let deficit = self.settings.num_standby.saturating_sub(standby.len());
        if deficit == 0 {
            return session.finish();
        }
        info!(deficit, "backfilling standby container pool");

        for _ in 0..deficit {
            session.capture(
                self.service
                    .create_or_replace_container(&session, None)
                    .await,
            );
        }
        session.finish()
    }

    /// Recreate every container to roll an image update. Terminates active
    /// sessions. Prior status is preserved: one-time apps are purged,
    /// running persistent containers are re-seeded into the active pool,
    /// exited persistent containers are re-checkpointed, standby
    /// containers are left running.
    pub async fn recreate_all_containers(&self) -> EngineResult<()> {
        let lock = self.service.lock().clone();
        {
            let session = lock.write().await;
            let containers = self.service.get_containers(&session, None, false).await?;
            info!(count = containers.len(), "recreating all containers");

            for container in containers {
                let identity = self
                    .service
                    .identity_for_hostname(&container.hostname)
                    .await?;

                if identity.is_assigned_to_one_time_app() {
                    session.capture(self.service.purge_container(&session, &container).await);
                    continue;
                }

                let keep_running = container.status == ContainerStatus::Running;
                let mount_dir = self.settings.mount_dir(&container.hostname);
                let Some(reloaded) = session.capture(
                    self.service
                        .create_or_replace_container(&session, Some(&mount_dir))
                        .await,
                ) else {
                    continue;
                };

                if identity.is_assigned_to_persistent_user() {
                    if keep_running {
                        self.active
                            .lock()
                            .insert(reloaded.hostname.clone(), reloaded);
                    } else {
                        session.capture(
                            self.service
                                .checkpoint_container(&session, &reloaded)
                                .await,
                        );
                    }
                }
            }
            session.finish()?;
        }
        self.refresh_standby_pool().await
    }

    /// Re-seed the active pool from running assigned containers after a
    /// gateway restart, so their TTL clock restarts instead of the gateway
    /// forgetting them.
    pub async fn init_active_assigned_pool(&self) -> EngineResult<()> {
        let containers = {
            let session = self.service.lock().read().await;
            self.service.get_containers(&session, None, false).await?
        };

        let mut pool = self.active.lock();
        for container in containers {
            if container.status == ContainerStatus::Running
                && !container.name.starts_with(UNASSIGNED_USER_ID)
            {
                info!(
                    hostname = %container.hostname,
                    "re-seeding active pool after restart"
                );
                pool.insert(container.hostname.clone(), container);
            }
        }
        Ok(())
    }

    /// Free up the resources used by a container: checkpoint for
    /// persistent users, purge for one-time apps. Called from the TTL
    /// callbacks.
    pub async fn release_container(self: Arc<Self>, container: Container) {
        if let Err(release_error) = self.try_release(&container).await {
            error!(
                error = %release_error,
                hostname = %container.hostname,
                "failed to release container"
            );
        }
    }

    async fn try_release(&self, container: &Container) -> EngineResult<()> {
        let identity = self
            .service
            .identity_for_hostname(&container.hostname)
            .await?;
        let lock = self.service.lock().clone();
        {
            let session = lock.write().await;
            if identity.is_assigned_to_persistent_user() {
                match self.service.checkpoint_container(&session, container).await {
                    Ok(_) => {}
                    Err(EngineError::Unsupported { .. }) => {
                        // degraded engine: keep the container running with
                        // a fresh TTL instead of checkpointing
                        warn!(
                            hostname = %container.hostname,
                            "engine cannot checkpoint, keeping container running"
                        );
                        self.active
                            .lock()
                            .insert(container.hostname.clone(), container.clone());
                        return session.finish();
                    }
                    Err(other) => return Err(other),
                }
            } else {
                self.service.purge_container(&session, container).await?;
            }
            session.finish()?;
        }
        // hold the running-count invariant
        self.refresh_standby_pool().await
    }

    /// Periodic maintenance: settle outstanding release tasks, then
    /// advance the TTL clock. Returns the TTL so the caller can sleep
    /// exactly that interval.
    pub async fn perform_maintenance(&self) -> Duration {
        self.drain_release_tasks().await;
        let expired = self.active.lock().expire();
        if expired > 0 {
            info!(expired, "expired containers from the active pool");
        }
        self.settings.active_ttl
    }

    /// Await every outstanding release task.
    pub async fn drain_release_tasks(&self) {
        let mut tasks = { std::mem::take(&mut *self.release_tasks.lock()) };
        while let Some(result) = tasks.join_next().await {
            if let Err(join_error) = result {
                error!(error = %join_error, "container release task panicked");
            }
        }
    }

    /// Expire entries as if `now` were the given instant. Test hook for
    /// TTL-driven behavior.
    #[doc(hidden)]
    pub fn expire_active_at(&self, now: std::time::Instant) -> usize {
        self.active.lock().expire_at(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeEngine;
    use crate::settings::EngineKind;
    use crate::user::AuthProvider;
    use std::path::Path;
    use std::time::Instant;

    fn test_settings(data_dir: &Path, num_standby: usize) -> Arc<ContainerSettings> {
        Arc::new(ContainerSettings {
            engine: EngineKind::Podman,
            project_name: "getgather".into(),
            data_dir: data_dir.to_path_buf(),
            subnet_prefix: "10.89.0".into(),
            num_standby,
            active_ttl: Duration::from_secs(600),
            max_running: 10,
            gateway_origin: "https://gw.example.com".into(),
            log_level: "INFO".into(),
            browser_timeout: 30_000,
            default_proxy_type: None,
            proxies_file: data_dir.join("proxies.yaml"),
        })
    }

    fn manager_with_fake(
        data_dir: &Path,
        num_standby: usize,
        capacity: usize,
    ) -> (Arc<FakeEngine>, Arc<ContainerManager>) {
        let settings = test_settings(data_dir, num_standby);
        let engine = Arc::new(FakeEngine::new(settings.network_name()));
        let service = Arc::new(ContainerService::new(engine.clone(), settings.clone()));
        let manager = ContainerManager::with_capacity(service, settings, capacity);
        (engine, manager)
    }

    fn standby_count(engine: &FakeEngine) -> usize {
        engine
            .container_names()
            .iter()
            .filter(|name| name.starts_with("UNASSIGNED-"))
            .count()
    }

    #[tokio::test]
    async fn test_refresh_fills_standby_pool() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = manager_with_fake(dir.path(), 2, 4);

        manager.refresh_standby_pool().await.unwrap();
        assert_eq!(standby_count(&engine), 2);

        // idempotent once the pool is full
        manager.refresh_standby_pool().await.unwrap();
        assert_eq!(standby_count(&engine), 2);
    }

    #[tokio::test]
    async fn test_get_user_container_assigns_and_refills() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = manager_with_fake(dir.path(), 2, 4);
        manager.refresh_standby_pool().await.unwrap();

        let user = AuthUser::new("12345", AuthProvider::Github);
        let container = manager.get_user_container(&user).await.unwrap();
        assert_eq!(
            container.name,
            format!("12345.github-{}", container.hostname)
        );
        assert!(manager.active_hostnames().contains(&container.hostname));

        // the background refill task restores the standby pool
        manager.drain_release_tasks().await;
        for _ in 0..50 {
            if standby_count(&engine) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(standby_count(&engine), 2);
    }

    #[tokio::test]
    async fn test_get_user_container_is_stable_for_same_user() {
        let dir = tempfile::tempdir().unwrap();
        let (_engine, manager) = manager_with_fake(dir.path(), 2, 4);
        manager.refresh_standby_pool().await.unwrap();

        let user = AuthUser::new("12345", AuthProvider::Github);
        let first = manager.get_user_container(&user).await.unwrap();
        let second = manager.get_user_container(&user).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.hostname, second.hostname);
    }

    #[tokio::test]
    async fn test_concurrent_requests_for_new_user_share_one_container() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = manager_with_fake(dir.path(), 2, 4);
        manager.refresh_standby_pool().await.unwrap();

        let user = AuthUser::new("12345", AuthProvider::Github);
        let first_task = {
            let manager = Arc::clone(&manager);
            let user = user.clone();
            tokio::spawn(async move { manager.get_user_container(&user).await })
        };
        let second_task = {
            let manager = Arc::clone(&manager);
            let user = user.clone();
            tokio::spawn(async move { manager.get_user_container(&user).await })
        };

        let first = first_task.await.unwrap().unwrap();
        let second = second_task.await.unwrap().unwrap();
        assert_eq!(first.hostname, second.hostname);

        let assigned = engine
            .container_names()
            .iter()
            .filter(|name| name.contains(&user.user_id()))
            .count();
        assert_eq!(assigned, 1);
    }

    #[tokio::test]
    async fn test_no_standby_triggers_refill_before_assign() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = manager_with_fake(dir.path(), 1, 4);
        // no standby containers yet

        let user = AuthUser::new("12345", AuthProvider::Github);
        let container = manager.get_user_container(&user).await.unwrap();
        assert!(container.name.contains("12345.github"));
        assert!(engine
            .calls()
            .iter()
            .any(|call| call.starts_with("create_or_replace")));
    }

    #[tokio::test]
    async fn test_expiry_checkpoints_persistent_container() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = manager_with_fake(dir.path(), 1, 4);
        manager.refresh_standby_pool().await.unwrap();

        let user = AuthUser::new("12345", AuthProvider::Github);
        let container = manager.get_user_container(&user).await.unwrap();
        manager.drain_release_tasks().await;

        let expired = manager.expire_active_at(Instant::now() + Duration::from_secs(601));
        assert_eq!(expired, 1);
        manager.drain_release_tasks().await;

        assert!(engine
            .calls()
            .iter()
            .any(|call| call.starts_with("checkpoint")));
        let refreshed = manager
            .get_container_by_hostname(&container.hostname)
            .await
            .unwrap();
        assert!(refreshed.checkpointed);
        assert!(!refreshed.is_running());
    }

    #[tokio::test]
    async fn test_expiry_purges_one_time_container() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = manager_with_fake(dir.path(), 1, 4);
        manager.refresh_standby_pool().await.unwrap();

        let user = AuthUser::new("u42", AuthProvider::Getgather);
        let container = manager.get_user_container(&user).await.unwrap();
        manager.drain_release_tasks().await;

        manager.expire_active_at(Instant::now() + Duration::from_secs(601));
        manager.drain_release_tasks().await;

        assert!(!engine
            .calls()
            .iter()
            .any(|call| call.starts_with("checkpoint")));
        assert!(!engine
            .container_names()
            .iter()
            .any(|name| name.contains("u42.getgather")));
        // mount dir moved to quarantine
        let settings = test_settings(dir.path(), 1);
        assert!(settings.cleanup_dir().join(&container.hostname).exists());
    }

    #[tokio::test]
    async fn test_checkpointed_container_is_restored_with_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let (_engine, manager) = manager_with_fake(dir.path(), 2, 4);
        manager.refresh_standby_pool().await.unwrap();

        let user = AuthUser::new("12345", AuthProvider::Github);
        let container = manager.get_user_container(&user).await.unwrap();
        manager.drain_release_tasks().await;

        manager.expire_active_at(Instant::now() + Duration::from_secs(601));
        manager.drain_release_tasks().await;

        let restored = manager.get_user_container(&user).await.unwrap();
        assert_eq!(restored.id, container.id);
        assert_eq!(restored.hostname, container.hostname);
        assert!(restored.is_running());
        assert!(manager.active_hostnames().contains(&restored.hostname));
    }

    #[tokio::test]
    async fn test_restore_purges_one_standby_first() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = manager_with_fake(dir.path(), 1, 4);
        manager.refresh_standby_pool().await.unwrap();

        let user = AuthUser::new("12345", AuthProvider::Github);
        manager.get_user_container(&user).await.unwrap();
        manager.drain_release_tasks().await;
        manager.expire_active_at(Instant::now() + Duration::from_secs(601));
        manager.drain_release_tasks().await;
        assert_eq!(standby_count(&engine), 1);

        manager.get_user_container(&user).await.unwrap();

        let calls = engine.calls();
        let purge_position = calls
            .iter()
            .rposition(|call| call.starts_with("delete"))
            .unwrap();
        let restore_position = calls
            .iter()
            .rposition(|call| call.starts_with("restore"))
            .unwrap();
        assert!(purge_position < restore_position);
    }

    #[tokio::test]
    async fn test_init_active_pool_reseeds_assigned_running_containers() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = manager_with_fake(dir.path(), 2, 4);

        engine.add_container("UNASSIGNED-aaa111", "aaa111", true, false);
        engine.add_container("12345.github-bbb222", "bbb222", true, false);
        engine.add_container("99.github-ccc333", "ccc333", false, true);

        manager.init_active_assigned_pool().await.unwrap();

        let hostnames = manager.active_hostnames();
        assert_eq!(hostnames, vec!["bbb222".to_string()]);
    }

    #[tokio::test]
    async fn test_degraded_engine_keeps_persistent_container_running() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path(), 1);
        let engine = Arc::new(FakeEngine::new(settings.network_name()).without_checkpoint());
        let service = Arc::new(ContainerService::new(engine.clone(), settings.clone()));
        let manager = ContainerManager::with_capacity(service, settings, 4);
        manager.refresh_standby_pool().await.unwrap();

        let user = AuthUser::new("12345", AuthProvider::Github);
        let container = manager.get_user_container(&user).await.unwrap();
        manager.drain_release_tasks().await;

        manager.expire_active_at(Instant::now() + Duration::from_secs(601));
        manager.drain_release_tasks().await;

        let refreshed = manager
            .get_container_by_hostname(&container.hostname)
            .await
            .unwrap();
        assert!(refreshed.is_running());
        assert!(manager.active_hostnames().contains(&container.hostname));
    }

    #[tokio::test]
    async fn test_recreate_all_preserves_lifecycles() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = manager_with_fake(dir.path(), 1, 4);
        manager.refresh_standby_pool().await.unwrap();

        let persistent = AuthUser::new("12345", AuthProvider::Github);
        manager.get_user_container(&persistent).await.unwrap();
        manager.drain_release_tasks().await;

        let one_time = AuthUser::new("u42", AuthProvider::Getgather);
        manager.get_user_container(&one_time).await.unwrap();
        manager.drain_release_tasks().await;

        manager.recreate_all_containers().await.unwrap();

        let names = engine.container_names();
        assert!(names.iter().any(|name| name.contains("12345.github")));
        assert!(!names.iter().any(|name| name.contains("u42.getgather")));
        assert_eq!(standby_count(&engine), 1);
    }

    #[tokio::test]
    async fn test_running_count_invariant_holds() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, manager) = manager_with_fake(dir.path(), 2, 3);
        manager.refresh_standby_pool().await.unwrap();

        for index in 0..3 {
            let user = AuthUser::new(format!("user{index}"), AuthProvider::Github);
            manager.get_user_container(&user).await.unwrap();
            manager.drain_release_tasks().await;
        }

        let names = engine.container_names();
        let running = names.len();
        assert!(
            running <= 2 + 3,
            "expected at most standby + active containers, got {running}"
        );
    }
}
