//! Running delegated CLI tools (`git`, `aws`) for adapters.

use crate::cancel::CancellationToken;
use crate::error::{FetchError, Result};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Captured result of one tool invocation.
#[derive(Debug)]
pub(crate) struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Last non-empty stderr line, for error messages.
    pub fn summary(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("no error output")
            .chars()
            .take(300)
            .collect()
    }
}

/// Run `command` to completion, killing it if `cancel` fires.
///
/// A missing executable is a `Command` error; a non-zero exit is returned
/// in [`ToolOutput`] for the caller to classify.
pub(crate) async fn run_tool(
    mut command: Command,
    program: &str,
    cancel: &CancellationToken,
) -> Result<ToolOutput> {
    cancel.check()?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| FetchError::Command {
        program: program.to_string(),
        message: if e.kind() == std::io::ErrorKind::NotFound {
            format!("`{}` is not installed or not on PATH", program)
        } else {
            format!("failed to start: {}", e)
        },
    })?;

    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(|e| FetchError::Command {
            program: program.to_string(),
            message: format!("failed to collect output: {}", e),
        })?,
        _ = cancel.cancelled() => {
            debug!("Cancelled while running {}", program);
            return Err(FetchError::Cancelled);
        }
    };

    Ok(ToolOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
