//! Engine error taxonomy shared by the CLI client, service, and manager.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine CLI timed out after {timeout_secs}s\ncommand: {command}")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("engine CLI failed: {message}\ncommand: {command}")]
    Failure { command: String, message: String },

    #[error("inspect returned {got} records for {want} ids")]
    Inconsistent { want: usize, got: usize },

    #[error("multiple containers found for name: {0}")]
    AmbiguousName(String),

    #[error("{operation} is only supported for podman on linux")]
    Unsupported { operation: &'static str },

    #[error("cannot upgrade a read lock to a write lock in a nested session")]
    LockUpgrade,

    #[error("no unassigned containers available")]
    NoStandby,

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container {0} has no IP address")]
    NoIp(String),

    #[error("failed to parse engine output: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("multiple engine operations failed: {} errors", .0.len())]
    Group(Vec<EngineError>),
}

pub type EngineResult<T> = Result<T, EngineError>;
