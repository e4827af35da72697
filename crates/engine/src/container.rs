//! Container entity parsed from `container inspect` records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Exited,
}

/// A single worker container.
///
/// `hostname` is the stable identifier across the container's whole life
/// and doubles as the mount-directory name; `ip` is present iff the
/// container is attached to the internal network.
#[derive(Debug, Clone, Serialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub ip: Option<String>,
    pub status: ContainerStatus,
    pub started_at: DateTime<Utc>,
    pub checkpointed: bool,

    /// Raw inspect record, kept for diagnostics.
    #[serde(skip)]
    pub info: Value,
    /// Network used to resolve `ip`.
    #[serde(skip)]
    pub network_name: String,
}

impl Container {
    pub fn from_inspect(info: &Value, network_name: &str) -> EngineResult<Self> {
        let id = info["Id"]
            .as_str()
            .ok_or_else(|| EngineError::Parse("inspect record missing Id".into()))?;
        let name = info["Name"]
            .as_str()
            .ok_or_else(|| EngineError::Parse("inspect record missing Name".into()))?
            .trim_start_matches('/')
            .to_string();
        let hostname = info["Config"]["Hostname"]
            .as_str()
            .ok_or_else(|| EngineError::Parse("inspect record missing Config.Hostname".into()))?
            .to_string();

        let ip = info["NetworkSettings"]["Networks"][network_name]["IPAddress"]
            .as_str()
            .filter(|ip| !ip.is_empty())
            .map(str::to_string);

        let status = match info["State"]["Status"].as_str() {
            Some("running") => ContainerStatus::Running,
            _ => ContainerStatus::Exited,
        };

        let started_at = info["State"]["StartedAt"]
            .as_str()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .ok_or_else(|| EngineError::Parse("inspect record missing State.StartedAt".into()))?;

        let checkpointed = info["State"]["Checkpointed"].as_bool().unwrap_or(false);

        Ok(Self {
            id: id.chars().take(12).collect(),
            name,
            hostname,
            ip,
            status,
            started_at,
            checkpointed,
            info: info.clone(),
            network_name: network_name.to_string(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// IP address, required for routing requests to the container.
    pub fn validated_ip(&self) -> EngineResult<&str> {
        self.ip
            .as_deref()
            .ok_or_else(|| EngineError::NoIp(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inspect_record() -> Value {
        json!({
            "Id": "0123456789abcdef0123",
            "Name": "/UNASSIGNED-abc234",
            "Config": { "Hostname": "abc234" },
            "State": {
                "Status": "running",
                "StartedAt": "2025-06-01T10:00:00.123456789Z",
                "Checkpointed": false
            },
            "NetworkSettings": {
                "Networks": {
                    "getgather_internal-net": { "IPAddress": "10.89.0.5" }
                }
            }
        })
    }

    #[test]
    fn test_from_inspect_parses_fields() {
        let container =
            Container::from_inspect(&inspect_record(), "getgather_internal-net").unwrap();
        assert_eq!(container.id, "0123456789ab");
        assert_eq!(container.name, "UNASSIGNED-abc234");
        assert_eq!(container.hostname, "abc234");
        assert_eq!(container.ip.as_deref(), Some("10.89.0.5"));
        assert_eq!(container.status, ContainerStatus::Running);
        assert!(!container.checkpointed);
    }

    #[test]
    fn test_ip_is_none_when_not_on_network() {
        let container = Container::from_inspect(&inspect_record(), "other-net").unwrap();
        assert!(container.ip.is_none());
        assert!(matches!(
            container.validated_ip(),
            Err(EngineError::NoIp(_))
        ));
    }

    #[test]
    fn test_empty_ip_treated_as_disconnected() {
        let mut record = inspect_record();
        record["NetworkSettings"]["Networks"]["getgather_internal-net"]["IPAddress"] =
            json!("");
        let container = Container::from_inspect(&record, "getgather_internal-net").unwrap();
        assert!(container.ip.is_none());
    }

    #[test]
    fn test_non_running_status_maps_to_exited() {
        let mut record = inspect_record();
        record["State"]["Status"] = json!("exited");
        record["State"]["Checkpointed"] = json!(true);
        let container = Container::from_inspect(&record, "getgather_internal-net").unwrap();
        assert_eq!(container.status, ContainerStatus::Exited);
        assert!(container.checkpointed);
    }

    #[test]
    fn test_serialization_excludes_raw_info() {
        let container =
            Container::from_inspect(&inspect_record(), "getgather_internal-net").unwrap();
        let dumped = serde_json::to_value(&container).unwrap();
        assert!(dumped.get("info").is_none());
        assert!(dumped.get("network_name").is_none());
        assert_eq!(dumped["status"], json!("running"));
    }
}
