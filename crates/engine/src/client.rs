//! CLI-backed engine client for docker / podman.
//!
//! Container names and hostnames carry routing semantics, so the client
//! never mutates them except through `rename`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::cli::{run_cli, CREATE_TIMEOUT, DEFAULT_TIMEOUT, PULL_TIMEOUT};
use crate::container::Container;
use crate::error::{EngineError, EngineResult};
use crate::lock::EngineSession;
use crate::ops::{
    ContainerBasicInfo, ContainerSpec, EngineCapabilities, EngineOps, ListFilter, ListStatus,
};
use crate::settings::EngineKind;

pub struct CliEngineClient {
    engine: EngineKind,
    network: String,
    socket: String,
}

impl CliEngineClient {
    pub fn new(engine: EngineKind, network: impl Into<String>) -> Self {
        Self {
            engine,
            network: network.into(),
            socket: engine.socket(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    async fn run(
        &self,
        args: Vec<String>,
        as_root: bool,
        timeout: Duration,
    ) -> EngineResult<String> {
        let mut env = HashMap::new();
        if !cfg!(target_os = "macos") {
            env.insert("DOCKER_HOST".to_string(), self.socket.clone());
            if self.engine == EngineKind::Podman {
                env.insert("CONTAINER_HOST".to_string(), self.socket.clone());
            }
        }

        let mut full_args = Vec::with_capacity(args.len() + 1);
        if self.engine == EngineKind::Podman {
            full_args.push("--remote".to_string());
        }
        full_args.extend(args);

        run_cli(self.engine.program(), &full_args, &env, as_root, timeout).await
    }
}

pub(crate) fn list_args(filter: &ListFilter) -> Vec<String> {
    let mut args: Vec<String> = vec!["container".into(), "ls".into()];
    if filter.status == ListStatus::All {
        args.push("--all".into());
    }
    if let Some(partial_name) = &filter.partial_name {
        args.push("--filter".into());
        args.push(format!("name={partial_name}"));
    }
    for (key, value) in &filter.labels {
        args.push("--filter".into());
        args.push(format!("label={key}={value}"));
    }
    args.push("--format".into());
    args.push("{{.ID}} {{.Names}}".into());
    args
}

pub(crate) fn run_args(spec: &ContainerSpec, network: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--restart".into(),
        "on-failure:3".into(),
        "--name".into(),
        spec.name.clone(),
        "--hostname".into(),
        spec.hostname.clone(),
        "--user".into(),
        spec.user.clone(),
        // DNS servers for external name resolution
        "--dns".into(),
        "8.8.8.8".into(),
        "--dns".into(),
        "1.1.1.1".into(),
    ];
    for (key, value) in &spec.envs {
        args.push("--env".into());
        args.push(format!("{key}={value}"));
    }
    for volume in &spec.volumes {
        args.push("--volume".into());
        args.push(volume.clone());
    }
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }
    for cap in &spec.cap_adds {
        args.push("--cap-add".into());
        args.push(cap.clone());
    }
    args.push("--network".into());
    args.push(network.to_string());
    if let Some(entrypoint) = &spec.entrypoint {
        args.push("--entrypoint".into());
        args.push(entrypoint.clone());
    }
    args.push(spec.image.clone());
    args.extend(spec.cmd.iter().cloned());
    args
}

#[async_trait]
impl EngineOps for CliEngineClient {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            checkpoint: self.engine == EngineKind::Podman && cfg!(target_os = "linux"),
        }
    }

    async fn list_basic(
        &self,
        _session: &EngineSession,
        filter: &ListFilter,
    ) -> EngineResult<Vec<ContainerBasicInfo>> {
        let out = self.run(list_args(filter), false, DEFAULT_TIMEOUT).await?;
        let mut infos = Vec::new();
        for line in out.lines() {
            let mut parts = line.split_whitespace();
            let (Some(id), Some(name)) = (parts.next(), parts.next()) else {
                return Err(EngineError::Parse(format!("unexpected ls line: {line}")));
            };
            infos.push(ContainerBasicInfo {
                id: id.to_string(),
                name: name.to_string(),
            });
        }
        Ok(infos)
    }

    async fn list(
        &self,
        session: &EngineSession,
        filter: &ListFilter,
    ) -> EngineResult<Vec<Container>> {
        let basic = self.list_basic(session, filter).await?;
        if basic.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = basic.into_iter().map(|info| info.id).collect();
        let infos = self.inspect(session, &ids).await?;
        infos
            .iter()
            .map(|info| Container::from_inspect(info, &self.network))
            .collect()
    }

    async fn inspect(&self, _session: &EngineSession, ids: &[String]) -> EngineResult<Vec<Value>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args: Vec<String> = vec!["container".into(), "inspect".into()];
        args.extend(ids.iter().cloned());
        args.push("--format".into());
        args.push("json".into());
        let out = self.run(args, false, DEFAULT_TIMEOUT).await?;
        let infos: Vec<Value> = serde_json::from_str(&out)?;
        if infos.len() != ids.len() {
            return Err(EngineError::Inconsistent {
                want: ids.len(),
                got: infos.len(),
            });
        }
        Ok(infos)
    }

    async fn get_by_id(&self, session: &EngineSession, id: &str) -> EngineResult<Container> {
        let infos = self.inspect(session, &[id.to_string()]).await?;
        Container::from_inspect(&infos[0], &self.network)
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
        let existing = self.list(session, &ListFilter::named(&spec.name)).await?;
        if existing.len() > 1 {
            return Err(EngineError::AmbiguousName(spec.name.clone()));
        }
        if let Some(found) = existing.first() {
            self.delete(session, &[found.id.clone()]).await?;
        }

        // containers start slowly, especially on Docker Desktop for macOS
        let id = self
            .run(run_args(spec, &self.network), false, CREATE_TIMEOUT)
            .await?;
        self.get_by_id(session, &id).await
    }

    async fn start(&self, session: &EngineSession, id: &str) -> EngineResult<()> {
        session.require_write()?;
        self.run(
            vec!["container".into(), "start".into(), id.to_string()],
            false,
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn rename(&self, session: &EngineSession, id: &str, new_name: &str) -> EngineResult<()> {
        session.require_write()?;
        self.run(
            vec![
                "container".into(),
                "rename".into(),
                id.to_string(),
                new_name.to_string(),
            ],
            false,
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn checkpoint(&self, session: &EngineSession, id: &str) -> EngineResult<()> {
        session.require_write()?;
        if !self.capabilities().checkpoint {
            return Err(EngineError::Unsupported {
                operation: "checkpoint",
            });
        }
        self.run(
            vec!["container".into(), "checkpoint".into(), id.to_string()],
            true,
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn restore(&self, session: &EngineSession, id: &str) -> EngineResult<()> {
        session.require_write()?;
        if !self.capabilities().checkpoint {
            return Err(EngineError::Unsupported {
                operation: "restore",
            });
        }
        self.run(
            vec!["container".into(), "restore".into(), id.to_string()],
            true,
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn connect_network(&self, session: &EngineSession, id: &str) -> EngineResult<()> {
        session.require_write()?;
        let result = self
            .run(
                vec![
                    "network".into(),
                    "connect".into(),
                    self.network.clone(),
                    id.to_string(),
                ],
                false,
                DEFAULT_TIMEOUT,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(error) => {
                // defensively idempotent: the post-condition may already hold
                let container = self.get_by_id(session, id).await?;
                if container.ip.is_some() {
                    warn!(
                        container = %container.name,
                        network = %self.network,
                        "network connect failed but container already has an IP, skipping"
                    );
                    Ok(())
                } else {
                    Err(error)
                }
            }
        }
    }

    async fn disconnect_network(&self, session: &EngineSession, id: &str) -> EngineResult<()> {
        session.require_write()?;
        let result = self
            .run(
                vec![
                    "network".into(),
                    "disconnect".into(),
                    self.network.clone(),
                    id.to_string(),
                ],
                false,
                DEFAULT_TIMEOUT,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(error) => {
                let container = self.get_by_id(session, id).await?;
                if container.ip.is_none() {
                    warn!(
                        container = %container.name,
                        network = %self.network,
                        "network disconnect failed but container has no IP, skipping"
                    );
                    Ok(())
                } else {
                    Err(error)
                }
            }
        }
    }

    async fn delete(&self, session: &EngineSession, ids: &[String]) -> EngineResult<()> {
        session.require_write()?;
        if ids.is_empty() {
            return Ok(());
        }
        let mut args: Vec<String> = vec!["container".into(), "rm".into(), "--force".into()];
        if self.engine == EngineKind::Podman {
            args.push("--time".into());
            args.push("0".into());
        }
        args.extend(ids.iter().cloned());
        self.run(args, false, DEFAULT_TIMEOUT).await?;
        Ok(())
    }

    async fn pull_image(
        &self,
        session: &EngineSession,
        source: &str,
        tag: Option<&str>,
    ) -> EngineResult<()> {
        session.require_write()?;
        self.run(
            vec!["image".into(), "pull".into(), source.to_string()],
            false,
            PULL_TIMEOUT,
        )
        .await?;
        if let Some(tag) = tag {
            self.run(
                vec![
                    "image".into(),
                    "tag".into(),
                    source.to_string(),
                    tag.to_string(),
                ],
                false,
                DEFAULT_TIMEOUT,
            )
            .await?;
        }
        Ok(())
    }

    async fn exec(&self, session: &EngineSession, id: &str, cmd: &[String]) -> EngineResult<()> {
        session.require_write()?;
        let mut args: Vec<String> = vec!["exec".into(), "-d".into(), id.to_string()];
        args.extend(cmd.iter().cloned());
        self.run(args, false, DEFAULT_TIMEOUT).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_list_args_with_filters() {
        let filter = ListFilter::named("UNASSIGNED").with_labels(BTreeMap::from([(
            "com.docker.compose.project".to_string(),
            "getgather".to_string(),
        )]));
        let args = list_args(&filter);
        assert_eq!(args[0], "container");
        assert_eq!(args[1], "ls");
        assert!(args.contains(&"--all".to_string()));
        assert!(args.contains(&"name=UNASSIGNED".to_string()));
        assert!(args.contains(&"label=com.docker.compose.project=getgather".to_string()));
        assert_eq!(args.last().unwrap(), "{{.ID}} {{.Names}}");
    }

    #[test]
    fn test_list_args_running_only() {
        let filter = ListFilter::default().with_status(ListStatus::Running);
        let args = list_args(&filter);
        assert!(!args.contains(&"--all".to_string()));
    }

    #[test]
    fn test_run_args_shape() {
        let spec = ContainerSpec {
            name: "UNASSIGNED-abc234".into(),
            hostname: "abc234".into(),
            user: "root".into(),
            image: "getgather_mcp-getgather".into(),
            entrypoint: Some("/bin/sh".into()),
            cmd: vec!["-c".into(), "exec /app/entrypoint.sh".into()],
            envs: BTreeMap::from([("PORT".to_string(), "80".to_string())]),
            volumes: vec!["/srv/data/container_mounts/abc234:/app/data:rw".into()],
            labels: BTreeMap::from([("com.docker.compose.service".to_string(), "mcp-getgather".to_string())]),
            cap_adds: vec!["NET_BIND_SERVICE".into()],
        };
        let args = run_args(&spec, "getgather_internal-net");

        assert_eq!(&args[..4], &["run", "-d", "--restart", "on-failure:3"]);
        assert!(args.windows(2).any(|w| w == ["--name", "UNASSIGNED-abc234"]));
        assert!(args.windows(2).any(|w| w == ["--env", "PORT=80"]));
        assert!(args.windows(2).any(|w| w == ["--network", "getgather_internal-net"]));
        assert!(args.windows(2).any(|w| w == ["--entrypoint", "/bin/sh"]));
        // image comes before the command
        let image_pos = args.iter().position(|a| a == "getgather_mcp-getgather").unwrap();
        assert_eq!(args[image_pos + 1], "-c");
        assert_eq!(args.last().unwrap(), "exec /app/entrypoint.sh");
    }
}
