//! Background maintenance loop.
//!
//! Each tick settles outstanding release tasks and advances the TTL clock
//! of the active pool, then sleeps exactly the pool TTL. The loop exits
//! promptly when shutdown is signalled, draining remaining release tasks.

use std::sync::Arc;

use engine::manager::ContainerManager;
use tokio::sync::watch;
use tracing::info;

pub async fn maintenance_loop(manager: Arc<ContainerManager>, mut stop: watch::Receiver<bool>) {
    loop {
        let interval = manager.perform_maintenance().await;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => break,
        }
    }
    info!("maintenance loop stopping, draining release tasks");
    manager.drain_release_tasks().await;
}
