//! Admin endpoints.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use tracing::info;

use crate::error::{GatewayError, GatewayResult};
use crate::state::AppState;

/// Pull a fresh worker image and recreate every container. Terminates
/// active sessions.
pub async fn reload_containers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<StatusCode> {
    let provided = headers
        .get("x-admin-token")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if provided.is_empty()
        || state.config.admin_api_token.is_empty()
        || provided != state.config.admin_api_token
    {
        return Err(GatewayError::AuthTokenInvalid(
            "missing or invalid admin token".into(),
        ));
    }

    info!("admin reload: pulling image and recreating containers");
    {
        let session = state.manager.service().lock().write().await;
        state
            .manager
            .service()
            .pull_container_image(&session)
            .await?;
        session.finish()?;
    }
    state.manager.recreate_all_containers().await?;
    Ok(StatusCode::OK)
}
