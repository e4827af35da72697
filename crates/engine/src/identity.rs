//! Container name algebra: hostname ⇄ container name ⇄ assigned user.

use serde::Serialize;

use crate::user::{AuthProvider, AuthUser};

pub const UNASSIGNED_USER_ID: &str = "UNASSIGNED";

/// Converts between container name, hostname, and assigned user.
///
/// Container names have the form `{user_id}-{hostname}` for assigned
/// containers and `UNASSIGNED-{hostname}` for standby containers, so a
/// substring scan on either the user id or the hostname finds a container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerIdentity {
    pub hostname: String,
    pub user_id: String,
    pub user: Option<AuthUser>,
}

impl ContainerIdentity {
    pub fn unassigned(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            user_id: UNASSIGNED_USER_ID.to_string(),
            user: None,
        }
    }

    pub fn for_user(hostname: impl Into<String>, user: AuthUser) -> Self {
        Self {
            hostname: hostname.into(),
            user_id: user.user_id(),
            user: Some(user),
        }
    }

    pub fn container_name(&self) -> String {
        format!("{}-{}", self.user_id, self.hostname)
    }

    pub fn is_standby(&self) -> bool {
        self.user.is_none()
    }

    pub fn is_assigned_to_persistent_user(&self) -> bool {
        self.user
            .as_ref()
            .map(AuthUser::is_persistent)
            .unwrap_or(false)
    }

    pub fn is_assigned_to_one_time_app(&self) -> bool {
        self.user
            .as_ref()
            .map(|user| user.auth_provider == AuthProvider::Getgather)
            .unwrap_or(false)
    }

    /// The hostname is always the last `-`-separated segment of the name.
    pub fn hostname_from_container_name(name: &str) -> &str {
        name.rsplit('-').next().unwrap_or(name)
    }
}
