//! Bearer-token router.
//!
//! Tokens carry their provider in the prefix:
//! - `getgather_{app_key}_{user_sub}` — first-party static tokens;
//! - `gho_` / `ghp_` / `ghu_` — GitHub tokens, verified upstream;
//! - anything else — Google tokens, verified upstream.

use std::collections::HashMap;

use engine::user::{AuthProvider, AuthUser};
use tracing::warn;

use crate::auth::providers::ProviderSet;
use crate::error::{GatewayError, GatewayResult};
use crate::http_utils::token_prefix;

pub const GETGATHER_TOKEN_PREFIX: &str = "getgather";

/// Dummy scope so OAuth scope validation has something to validate.
pub const OAUTH_SCOPES: &[&str] = &["getgather_user_scope"];

/// Naming pattern required by docker/podman: `^[a-zA-Z0-9][a-zA-Z0-9_.-]*$`.
fn is_valid_user_sub(sub: &str) -> bool {
    let mut chars = sub.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

pub struct TokenRouter {
    apps: HashMap<String, String>,
    persistent_apps: HashMap<String, String>,
}

impl TokenRouter {
    pub fn new(apps: HashMap<String, String>, persistent_apps: HashMap<String, String>) -> Self {
        Self {
            apps,
            persistent_apps,
        }
    }

    pub fn has_first_party_apps(&self) -> bool {
        !self.apps.is_empty() || !self.persistent_apps.is_empty()
    }

    pub fn accepts_first_party(token: &str) -> bool {
        token.starts_with(&format!("{GETGATHER_TOKEN_PREFIX}_"))
    }

    pub fn accepts_github(token: &str) -> bool {
        token.starts_with("gho_") || token.starts_with("ghp_") || token.starts_with("ghu_")
    }

    /// Verify a bearer token, dispatching by prefix in priority order:
    /// first-party → GitHub → Google.
    pub async fn verify(&self, providers: &ProviderSet, token: &str) -> GatewayResult<AuthUser> {
        if Self::accepts_first_party(token) {
            return self.verify_first_party(token);
        }

        let result = if Self::accepts_github(token) {
            let github = providers
                .github
                .as_ref()
                .ok_or_else(|| GatewayError::AuthProviderUnconfigured("github".into()))?;
            github.verify_token(token).await
        } else {
            let google = providers
                .google
                .as_ref()
                .ok_or_else(|| GatewayError::AuthProviderUnconfigured("google".into()))?;
            google.verify_token(token).await
        };

        if let Err(error) = &result {
            warn!(
                token_prefix = token_prefix(token),
                %error,
                "bearer token verification failed"
            );
        }
        result
    }

    /// First-party tokens have the form `getgather_{app_key}_{user_sub}`,
    /// where `app_key` must be in a configured allow-list and `user_sub`
    /// must be DNS/filename safe.
    pub fn verify_first_party(&self, token: &str) -> GatewayResult<AuthUser> {
        let parts: Vec<&str> = token.split('_').collect();
        if parts.len() < 3 || parts[0] != GETGATHER_TOKEN_PREFIX {
            warn!(
                token_prefix = token_prefix(token),
                "malformed first-party token"
            );
            return Err(GatewayError::AuthTokenInvalid(
                "malformed first-party token".into(),
            ));
        }

        let app_key = parts[1];
        let (app_name, provider) = if let Some(app_name) = self.persistent_apps.get(app_key) {
            (app_name.clone(), AuthProvider::GetgatherPersistent)
        } else if let Some(app_name) = self.apps.get(app_key) {
            (app_name.clone(), AuthProvider::Getgather)
        } else {
            warn!(
                token_prefix = token_prefix(token),
                "unknown first-party app key"
            );
            return Err(GatewayError::AuthTokenInvalid(
                "unknown first-party app key".into(),
            ));
        };

        let sub = parts[2..].join("_");
        if !is_valid_user_sub(&sub) {
            warn!(
                token_prefix = token_prefix(token),
                "first-party user id fails the naming pattern"
            );
            return Err(GatewayError::AuthTokenInvalid(
                "invalid first-party user id".into(),
            ));
        }

        let mut user = AuthUser::new(sub, provider);
        user.app_name = Some(app_name);
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> TokenRouter {
        TokenRouter::new(
            HashMap::from([("testapp".to_string(), "Test App".to_string())]),
            HashMap::from([("keeper".to_string(), "Keeper App".to_string())]),
        )
    }

    #[test]
    fn test_first_party_token_happy_path() {
        let user = router()
            .verify_first_party("getgather_testapp_u42")
            .unwrap();
        assert_eq!(user.sub, "u42");
        assert_eq!(user.auth_provider, AuthProvider::Getgather);
        assert_eq!(user.app_name.as_deref(), Some("Test App"));
        assert_eq!(user.user_id(), "u42.getgather");
    }

    #[test]
    fn test_first_party_persistent_app() {
        let user = router().verify_first_party("getgather_keeper_u42").unwrap();
        assert_eq!(user.auth_provider, AuthProvider::GetgatherPersistent);
        assert!(user.is_persistent());
    }

    #[test]
    fn test_first_party_sub_keeps_underscores() {
        let user = router()
            .verify_first_party("getgather_testapp_team_42_member")
            .unwrap();
        assert_eq!(user.sub, "team_42_member");
    }

    #[test]
    fn test_first_party_rejects_unknown_app() {
        assert!(matches!(
            router().verify_first_party("getgather_otherapp_u42"),
            Err(GatewayError::AuthTokenInvalid(_))
        ));
    }

    #[test]
    fn test_first_party_rejects_bad_sub() {
        // leading separator fails the naming pattern
        assert!(router()
            .verify_first_party("getgather_testapp_-leading")
            .is_err());
        assert!(router().verify_first_party("getgather_testapp_").is_err());
        assert!(router()
            .verify_first_party("getgather_testapp_user with space")
            .is_err());
    }

    #[test]
    fn test_prefix_dispatch_predicates() {
        assert!(TokenRouter::accepts_first_party("getgather_app_u"));
        assert!(!TokenRouter::accepts_first_party("getgatherx"));
        assert!(TokenRouter::accepts_github("gho_abc"));
        assert!(TokenRouter::accepts_github("ghp_abc"));
        assert!(TokenRouter::accepts_github("ghu_abc"));
        assert!(!TokenRouter::accepts_github("ya29.google"));
    }

    #[test]
    fn test_user_sub_pattern() {
        assert!(is_valid_user_sub("u42"));
        assert!(is_valid_user_sub("a.b-c_d"));
        assert!(!is_valid_user_sub(""));
        assert!(!is_valid_user_sub("-leading"));
        assert!(!is_valid_user_sub("has space"));
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_distinct_error() {
        let providers = ProviderSet::default();
        let error = router()
            .verify(&providers, "gho_sometoken")
            .await
            .unwrap_err();
        assert!(matches!(error, GatewayError::AuthProviderUnconfigured(_)));
    }
}
