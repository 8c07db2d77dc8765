//! Asynchronous utilities for use with Tokio.
//!
//! Everything that talks to an external process goes through here, so that
//! every command gets a timeout and has its output logged the same way.

use std::{process::Output, time::Duration};

use regex::Regex;
use tokio::{process::Command, time};

use crate::prelude::*;

pub mod io;
pub mod keyed_locks;

/// Run an external command to completion, killing it if it takes longer than
/// `timeout`.
#[instrument(level = "debug", skip(cmd, timeout))]
pub async fn output_with_timeout(
    command_name: &str,
    mut cmd: Command,
    timeout: Duration,
) -> Result<Output> {
    // `kill_on_drop` makes sure that dropping the future on timeout also
    // kills the child process.
    cmd.kill_on_drop(true);
    match time::timeout(timeout, cmd.output()).await {
        Ok(output) => output.with_context(|| format!("cannot run {command_name}")),
        Err(_) => Err(anyhow!(
            "{} timed out after {} seconds",
            command_name,
            timeout.as_secs_f32()
        )),
    }
}

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. And standard error may be optionally checked against a
/// regex to determine if the command failed.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    error_regex: Option<&Regex>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if let Some(regex) = error_regex {
            if regex.is_match(&stderr) {
                return Err(anyhow!(
                    "{} printed error output:\n{}",
                    command_name,
                    stderr,
                ));
            }
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        // Propagate any panics from the blocking task.
        Err(err) => std::panic::resume_unwind(err.into_panic()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_commands_time_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = output_with_timeout("sleep", cmd, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn failures_include_exit_code() {
        let cmd = Command::new("false");
        let output = output_with_timeout("false", cmd, Duration::from_secs(5))
            .await
            .unwrap();
        let err = check_for_command_failure("false", &output, None).unwrap_err();
        assert!(err.to_string().contains("exit code 1"), "{err}");
    }

    #[tokio::test]
    async fn error_regex_catches_successful_commands() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo 'Syntax Error: bad xref' >&2"]);
        let output = output_with_timeout("sh", cmd, Duration::from_secs(5))
            .await
            .unwrap();
        let regex = Regex::new(r"(?i)error").unwrap();
        assert!(check_for_command_failure("sh", &output, Some(&regex)).is_err());
        assert!(check_for_command_failure("sh", &output, None).is_ok());
    }
}
