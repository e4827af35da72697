//! In-memory engine test double.
//!
//! Mirrors the observable behavior of the CLI client closely enough for
//! service and manager tests: containers are kept as records, `inspect`
//! renders engine-shaped JSON so the real parsing path is exercised, and
//! mutating operations enforce the writer-lock discipline.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::container::Container;
use crate::error::{EngineError, EngineResult};
use crate::lock::EngineSession;
use crate::ops::{
    ContainerBasicInfo, ContainerSpec, EngineCapabilities, EngineOps, ListFilter, ListStatus,
};

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    name: String,
    hostname: String,
    ip: Option<String>,
    running: bool,
    checkpointed: bool,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct FakeState {
    containers: Vec<FakeContainer>,
    next_id: u64,
    next_ip: u8,
    calls: Vec<String>,
    pulled: Vec<(String, Option<String>)>,
}

pub struct FakeEngine {
    network: String,
    checkpoint_supported: bool,
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            checkpoint_supported: true,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn without_checkpoint(mut self) -> Self {
        self.checkpoint_supported = false;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn pulled_images(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().pulled.clone()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .containers
            .iter()
            .map(|container| container.name.clone())
            .collect()
    }

    /// Seed a container directly, bypassing `create_or_replace`.
    pub fn add_container(
        &self,
        name: &str,
        hostname: &str,
        running: bool,
        checkpointed: bool,
    ) -> String {
        let mut state = self.state.lock();
        let id = format!("{:012x}", state.next_id);
        state.next_id += 1;
        state.next_ip += 1;
        let ip = running.then(|| format!("10.89.0.{}", state.next_ip));
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            hostname: hostname.to_string(),
            ip,
            running,
            checkpointed,
            started_at: Utc::now() - ChronoDuration::seconds(60),
        });
        id
    }

    pub fn set_started_at(&self, name: &str, started_at: DateTime<Utc>) {
        let mut state = self.state.lock();
        if let Some(container) = state
            .containers
            .iter_mut()
            .find(|container| container.name == name)
        {
            container.started_at = started_at;
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().calls.push(call.into());
    }

    fn inspect_value(&self, container: &FakeContainer) -> Value {
        let networks = match &container.ip {
            Some(ip) => json!({ self.network.clone(): { "IPAddress": ip } }),
            None => json!({}),
        };
        json!({
            "Id": format!("{}ffffffffffff", container.id),
            "Name": format!("/{}", container.name),
            "Config": { "Hostname": container.hostname },
            "State": {
                "Status": if container.running { "running" } else { "exited" },
                "StartedAt": container.started_at.to_rfc3339(),
                "Checkpointed": container.checkpointed,
            },
            "NetworkSettings": { "Networks": networks },
        })
    }

    fn matches(container: &FakeContainer, filter: &ListFilter) -> bool {
        if filter.status == ListStatus::Running && !container.running {
            return false;
        }
        if let Some(partial_name) = &filter.partial_name {
            if !container.name.contains(partial_name.as_str()) {
                return false;
            }
        }
        true
    }

    fn container_to_model(&self, container: &FakeContainer) -> EngineResult<Container> {
        Container::from_inspect(&self.inspect_value(container), &self.network)
    }
}

#[async_trait]
impl EngineOps for FakeEngine {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            checkpoint: self.checkpoint_supported,
        }
    }

    async fn list_basic(
        &self,
        _session: &EngineSession,
        filter: &ListFilter,
    ) -> EngineResult<Vec<ContainerBasicInfo>> {
        let state = self.state.lock();
        Ok(state
            .containers
            .iter()
            .filter(|container| Self::matches(container, filter))
            .map(|container| ContainerBasicInfo {
                id: container.id.clone(),
                name: container.name.clone(),
            })
            .collect())
    }

    async fn list(
        &self,
        _session: &EngineSession,
        filter: &ListFilter,
    ) -> EngineResult<Vec<Container>> {
        let state = self.state.lock();
        state
            .containers
            .iter()
            .filter(|container| Self::matches(container, filter))
            .map(|container| self.container_to_model(container))
            .collect()
    }

    async fn inspect(&self, _session: &EngineSession, ids: &[String]) -> EngineResult<Vec<Value>> {
        let state = self.state.lock();
        let mut records = Vec::new();
        for id in ids {
            let Some(container) = state
                .containers
                .iter()
                .find(|container| &container.id == id)
            else {
                return Err(EngineError::Failure {
                    command: format!("container inspect {id}"),
                    message: format!("no such container: {id}"),
                });
            };
            records.push(self.inspect_value(container));
        }
        if records.len() != ids.len() {
            return Err(EngineError::Inconsistent {
                want: ids.len(),
                got: records.len(),
            });
        }
        Ok(records)
    }

    async fn get_by_id(&self, session: &EngineSession, id: &str) -> EngineResult<Container> {
        let records = self.inspect(session, &[id.to_string()]).await?;
        Container::from_inspect(&records[0], &self.network)
    }

    async fn get_by_name(&self, session: &EngineSession, name: &str) -> EngineResult<Container> {
        let mut containers = self.list(session, &ListFilter::named(name)).await?;
        match containers.len() {
            0 => Err(EngineError::NotFound(name.to_string())),
            1 => Ok(containers.remove(0)),
            _ => Err(EngineError::AmbiguousName(name.to_string())),
        }
    }

    async fn create_or_replace(
        &self,
        session: &EngineSession,
        spec: &ContainerSpec,
    ) -> EngineResult<Container> {
        session.require_write()?;
        self.record(format!("create_or_replace {}", spec.name));

        let mut state = self.state.lock();
        let existing: Vec<usize> = state
            .containers
            .iter()
            .enumerate()
            .filter(|(_, container)| container.name.contains(&spec.name))
            .map(|(index, _)| index)
            .collect();
        if existing.len() > 1 {
            return Err(EngineError::AmbiguousName(spec.name.clone()));
        }
        if let Some(&index) = existing.first() {
            state.containers.remove(index);
        }

        let id = format!("{:012x}", state.next_id);
        state.next_id += 1;
        state.next_ip += 1;
        let container = FakeContainer {
            id,
            name: spec.name.clone(),
            hostname: spec.hostname.clone(),
            ip: Some(format!("10.89.0.{}", state.next_ip)),
            running: true,
            checkpointed: false,
            started_at: Utc::now() - ChronoDuration::seconds(60),
        };
        let model = self.container_to_model(&container)?;
        state.containers.push(container);
        Ok(model)
    }

    async fn start(&self, session: &EngineSession, id: &str) -> EngineResult<()> {
        session.require_write()?;
        self.record(format!("start {id}"));
        let mut state = self.state.lock();
        match state
            .containers
            .iter_mut()
            .find(|container| container.id == id)
        {
            Some(container) => {
                container.running = true;
                container.checkpointed = false;
                container.started_at = Utc::now();
                Ok(())
            }
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn rename(&self, session: &EngineSession, id: &str, new_name: &str) -> EngineResult<()> {
        session.require_write()?;
        self.record(format!("rename {id} {new_name}"));
        let mut state = self.state.lock();
        match state
            .containers
            .iter_mut()
            .find(|container| container.id == id)
        {
            Some(container) => {
                container.name = new_name.to_string();
                Ok(())
            }
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn checkpoint(&self, session: &EngineSession, id: &str) -> EngineResult<()> {
        session.require_write()?;
        if !self.checkpoint_supported {
            return Err(EngineError::Unsupported {
                operation: "checkpoint",
            });
        }
        self.record(format!("checkpoint {id}"));
        let mut state = self.state.lock();
        match state
            .containers
            .iter_mut()
            .find(|container| container.id == id)
        {
            Some(container) => {
                container.running = false;
                container.checkpointed = true;
                Ok(())
            }
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn restore(&self, session: &EngineSession, id: &str) -> EngineResult<()> {
        session.require_write()?;
        if !self.checkpoint_supported {
            return Err(EngineError::Unsupported {
                operation: "restore",
            });
        }
        self.record(format!("restore {id}"));
        let mut state = self.state.lock();
        match state
            .containers
            .iter_mut()
            .find(|container| container.id == id)
        {
            Some(container) => {
                container.running = true;
                container.checkpointed = false;
                container.started_at = Utc::now();
                Ok(())
            }
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn connect_network(&self, session: &EngineSession, id: &str) -> EngineResult<()> {
        session.require_write()?;
        self.record(format!("connect {id}"));
        let mut state = self.state.lock();
        state.next_ip += 1;
        let ip = format!("10.89.0.{}", state.next_ip);
        match state
            .containers
            .iter_mut()
            .find(|container| container.id == id)
        {
            Some(container) => {
                container.ip = Some(ip);
                Ok(())
            }
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn disconnect_network(&self, session: &EngineSession, id: &str) -> EngineResult<()> {
        session.require_write()?;
        self.record(format!("disconnect {id}"));
        let mut state = self.state.lock();
        match state
            .containers
            .iter_mut()
            .find(|container| container.id == id)
        {
            Some(container) => {
                container.ip = None;
                Ok(())
            }
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, session: &EngineSession, ids: &[String]) -> EngineResult<()> {
        session.require_write()?;
        self.record(format!("delete {}", ids.join(",")));
        let mut state = self.state.lock();
        state
            .containers
            .retain(|container| !ids.contains(&container.id));
        Ok(())
    }

    async fn pull_image(
        &self,
        session: &EngineSession,
        source: &str,
        tag: Option<&str>,
    ) -> EngineResult<()> {
        session.require_write()?;
        self.record(format!("pull {source}"));
        self.state
            .lock()
            .pulled
            .push((source.to_string(), tag.map(str::to_string)));
        Ok(())
    }

    async fn exec(&self, session: &EngineSession, id: &str, cmd: &[String]) -> EngineResult<()> {
        session.require_write()?;
        self.record(format!("exec {id} {}", cmd.join(" ")));
        Ok(())
    }
}
