//! Health check handler.

use axum::extract::State;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> String {
    format!(
        "OK {} GIT_REV: {}",
        chrono::Utc::now().timestamp(),
        state.config.git_rev
    )
}
