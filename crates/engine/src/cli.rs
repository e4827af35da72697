//! Bounded subprocess runner for the container engine CLI.
//!
//! Every engine call is a subprocess invocation with a per-call timeout.
//! Exceeding the timeout kills the process and fails with
//! [`EngineError::Timeout`].

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{EngineError, EngineResult};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(30);
pub const PULL_TIMEOUT: Duration = Duration::from_secs(180);

/// Run a command and return its trimmed stdout.
pub async fn run_cli(
    program: &str,
    args: &[String],
    env: &HashMap<String, String>,
    as_root: bool,
    timeout: Duration,
) -> EngineResult<String> {
    let mut command = if as_root {
        let mut command = Command::new("sudo");
        command.arg(program);
        command
    } else {
        Command::new(program)
    };
    command
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let command_line = format!("{} {}", program, args.join(" "));

    let child = command.spawn()?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            // kill_on_drop reaps the child when the elapsed future is dropped
            return Err(EngineError::Timeout {
                command: command_line,
                timeout_secs: timeout.as_secs(),
            });
        }
    };

    tracing::debug!(
        command = %command_line,
        code = output.status.code(),
        "executed engine CLI command"
    );

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("returncode: {:?}", output.status.code())
        } else {
            stderr
        };
        return Err(EngineError::Failure {
            command: command_line,
            message,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_cli_captures_stdout() {
        let out = run_cli(
            "echo",
            &["hello".to_string()],
            &HashMap::new(),
            false,
            DEFAULT_TIMEOUT,
        )
        .await
        .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_run_cli_nonzero_exit_is_failure() {
        let err = run_cli(
            "sh",
            &["-c".to_string(), "echo boom >&2; exit 3".to_string()],
            &HashMap::new(),
            false,
            DEFAULT_TIMEOUT,
        )
        .await
        .unwrap_err();
        match err {
            EngineError::Failure { message, .. } => assert!(message.contains("boom")),
            other => panic!("expected Failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_cli_timeout_kills_process() {
        let err = run_cli(
            "sleep",
            &["5".to_string()],
            &HashMap::new(),
            false,
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
    }
}
