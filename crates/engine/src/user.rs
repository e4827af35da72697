//! Authenticated user identity, the routing key for container assignment.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthProvider {
    #[serde(rename = "github")]
    Github,
    #[serde(rename = "google")]
    Google,
    #[serde(rename = "getgather")]
    Getgather,
    #[serde(rename = "getgather-persistent")]
    GetgatherPersistent,
}

impl AuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthProvider::Github => "github",
            AuthProvider::Google => "google",
            AuthProvider::Getgather => "getgather",
            AuthProvider::GetgatherPersistent => "getgather-persistent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "github" => Some(AuthProvider::Github),
            "google" => Some(AuthProvider::Google),
            "getgather" => Some(AuthProvider::Getgather),
            "getgather-persistent" => Some(AuthProvider::GetgatherPersistent),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub sub: String,
    pub auth_provider: AuthProvider,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// github specific
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,

    /// google specific
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// first-party apps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
}

impl AuthUser {
    pub fn new(sub: impl Into<String>, auth_provider: AuthProvider) -> Self {
        Self {
            sub: sub.into(),
            auth_provider,
            name: None,
            login: None,
            email: None,
            app_name: None,
        }
    }

    /// Unique user id combining subject and auth provider. This is the
    /// routing key throughout the gateway and a substring of the
    /// container name.
    pub fn user_id(&self) -> String {
        format!("{}.{}", self.sub, self.auth_provider)
    }

    /// Persistent users keep their container across inactivity via
    /// checkpoint; one-time app users get theirs purged.
    pub fn is_persistent(&self) -> bool {
        self.auth_provider != AuthProvider::Getgather
    }

    pub fn is_admin(&self, admin_email_domain: &str) -> bool {
        if admin_email_domain.is_empty() {
            return false;
        }
        self.auth_provider == AuthProvider::Google
            && self
                .email
                .as_deref()
                .map(|email| {
                    email
                        .to_lowercase()
                        .ends_with(&format!("@{}", admin_email_domain.to_lowercase()))
                })
                .unwrap_or(false)
    }

    pub fn from_user_id(user_id: &str) -> Option<Self> {
        let (sub, provider) = user_id.rsplit_once('.')?;
        if sub.is_empty() {
            return None;
        }
        Some(Self::new(sub, AuthProvider::parse(provider)?))
    }
}
