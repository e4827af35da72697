//! Engine operations trait — abstract interface over the container engine.
//!
//! Every domain module reaches the engine through this trait.
//! `client.rs` provides the real CLI-backed implementation.
//! `fake.rs` provides a test double.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::container::Container;
use crate::error::EngineResult;
use crate::lock::EngineSession;

/// Engines are interchangeable at the CLI level but differ in what they
/// can do; capability queries keep those differences in one place.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineCapabilities {
    /// checkpoint/restore are supported only by Podman on Linux.
    pub checkpoint: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListStatus {
    Running,
    #[default]
    All,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub partial_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub status: ListStatus,
}

impl ListFilter {
    pub fn named(partial_name: impl Into<String>) -> Self {
        Self {
            partial_name: Some(partial_name.into()),
            ..Default::default()
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_status(mut self, status: ListStatus) -> Self {
        self.status = status;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerBasicInfo {
    pub id: String,
    pub name: String,
}

/// Everything needed to `run` a worker container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub hostname: String,
    pub user: String,
    pub image: String,
    pub entrypoint: Option<String>,
    pub cmd: Vec<String>,
    pub envs: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub cap_adds: Vec<String>,
}

#[async_trait]
pub trait EngineOps: Send + Sync {
    fn capabilities(&self) -> EngineCapabilities;

    async fn list_basic(
        &self,
        session: &EngineSession,
        filter: &ListFilter,
    ) -> EngineResult<Vec<ContainerBasicInfo>>;

    async fn list(
        &self,
        session: &EngineSession,
        filter: &ListFilter,
    ) -> EngineResult<Vec<Container>>;

    /// Returns exactly one record per id; a cardinality mismatch is an
    /// [`crate::error::EngineError::Inconsistent`].
    async fn inspect(&self, session: &EngineSession, ids: &[String]) -> EngineResult<Vec<Value>>;

    async fn get_by_id(&self, session: &EngineSession, id: &str) -> EngineResult<Container>;

    async fn get_by_name(&self, session: &EngineSession, name: &str) -> EngineResult<Container>;

    /// Idempotent by name: a single same-named container is deleted first,
    /// multiple fail with `AmbiguousName`.
    async fn create_or_replace(
        &self,
        session: &EngineSession,
        spec: &ContainerSpec,
    ) -> EngineResult<Container>;

    async fn start(&self, session: &EngineSession, id: &str) -> EngineResult<()>;

    async fn rename(&self, session: &EngineSession, id: &str, new_name: &str) -> EngineResult<()>;

    async fn checkpoint(&self, session: &EngineSession, id: &str) -> EngineResult<()>;

    async fn restore(&self, session: &EngineSession, id: &str) -> EngineResult<()>;

    async fn connect_network(&self, session: &EngineSession, id: &str) -> EngineResult<()>;

    async fn disconnect_network(&self, session: &EngineSession, id: &str) -> EngineResult<()>;

    async fn delete(&self, session: &EngineSession, ids: &[String]) -> EngineResult<()>;

    async fn pull_image(
        &self,
        session: &EngineSession,
        source: &str,
        tag: Option<&str>,
    ) -> EngineResult<()>;

    async fn exec(&self, session: &EngineSession, id: &str, cmd: &[String]) -> EngineResult<()>;
}
