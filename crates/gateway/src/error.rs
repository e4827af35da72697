//! Gateway error taxonomy and its mapping onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use engine::error::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid auth token: {0}")]
    AuthTokenInvalid(String),

    #[error("auth provider not configured: {0}")]
    AuthProviderUnconfigured(String),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("upstream proxy error: {0}")]
    Upstream(String),

    #[error("invalid route: {0}")]
    RouteInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Status mapping:
    /// - token errors → 401
    /// - no standby capacity → 503
    /// - not found → 404
    /// - malformed routes → 400
    /// - upstream failures → 502
    /// - everything else → 500
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthTokenInvalid(_) | GatewayError::AuthProviderUnconfigured(_) => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::Engine(EngineError::NoStandby) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Engine(EngineError::NotFound(_)) | GatewayError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::RouteInvalid(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(_) | GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // internal details are logged server-side, not exposed to clients
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal gateway error");
            return (status, "internal error".to_string()).into_response();
        }
        (status, self.to_string()).into_response()
    }
}
