//! Per-container metadata persisted in the mount directory.
//!
//! `metadata.json` is written at assignment and read during startup
//! recovery and re-creation from a mount directory. Absence of the file
//! means the container is standby.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::user::AuthUser;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub user: AuthUser,
}

impl ContainerMetadata {
    pub async fn read(path: &Path) -> EngineResult<Option<Self>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn write(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec(self)?).await?;
        Ok(())
    }
}
