//! Thin wrapper around the external CLIs (docker, kind) the adapters drive

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Turn a non-zero exit into an error carrying stderr
    pub fn into_result(self, what: &str) -> AppResult<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(AppError::command(format!("{}: {}", what, self.stderr.trim())))
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub async fn run(&self, args: &[&str]) -> AppResult<CommandOutput> {
        self.run_with(args, &[], None).await
    }

    /// Run with extra environment variables and optional stdin contents
    pub async fn run_with(
        &self,
        args: &[&str],
        envs: &[(&str, &str)],
        stdin: Option<&str>,
    ) -> AppResult<CommandOutput> {
        debug!(program = %self.program, ?args, "Running command");

        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .envs(envs.iter().copied())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::command(format!("failed to spawn {}: {}", self.program, e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            match pipe.write_all(input.as_bytes()).await {
                Ok(()) => {}
                // The child exited without reading; its status tells the rest
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(program = %self.program, "Child closed stdin early");
                }
                Err(e) => return Err(AppError::command(format!("failed to write stdin: {}", e))),
            }
            // Closing stdin lets the child see EOF
            drop(pipe);
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result
                .map_err(|e| AppError::command(format!("failed to wait for {}: {}", self.program, e)))?,
            Err(_) => {
                warn!(program = %self.program, ?args, timeout = ?self.timeout, "Command timed out");
                return Err(AppError::command(format!(
                    "{} {} timed out after {:?}",
                    self.program,
                    args.join(" "),
                    self.timeout
                )));
            }
        };

        let result = CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if !result.success {
            debug!(program = %self.program, stderr = %result.stderr.trim(), "Command exited with failure");
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_success() {
        let runner = CommandRunner::new("echo", Duration::from_secs(5));
        let output = runner.run(&["hello"]).await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_with_stdin() {
        let runner = CommandRunner::new("cat", Duration::from_secs(5));
        let output = runner.run_with(&[], &[], Some("piped")).await.unwrap();
        assert_eq!(output.stdout, "piped");
    }

    #[tokio::test]
    async fn test_failure_into_result() {
        let runner = CommandRunner::new("sh", Duration::from_secs(5));
        let output = runner.run(&["-c", "echo oops >&2; exit 3"]).await.unwrap();
        assert!(!output.success);
        let err = output.into_result("sh").unwrap_err();
        assert!(err.to_string().contains("oops"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = CommandRunner::new("definitely-not-a-real-binary", Duration::from_secs(5));
        assert!(runner.run(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout() {
        let runner = CommandRunner::new("sleep", Duration::from_millis(50));
        let err = runner.run(&["5"]).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
