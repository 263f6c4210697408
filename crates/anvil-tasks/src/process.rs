//! Process spawning with cooperative cancellation

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::delegates::{
    ClientDelegate, DynamicTaskExecutionDelegate, ExternalToolResult, TaskOutputDelegate,
};
use crate::error::{Result, TaskError};
use crate::task::{CommandResult, EnvironmentBindings};

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `command_line` to completion.
///
/// The environment is exactly `environment`; nothing is inherited. Returns
/// [`TaskError::Cancelled`] if `cancel` fires first, after killing the child.
pub async fn spawn(
    command_line: &[String],
    environment: &EnvironmentBindings,
    working_directory: &Path,
    cancel: CancellationToken,
) -> Result<ProcessOutput> {
    let (program, args) = command_line.split_first().ok_or(TaskError::EmptyCommandLine)?;
    debug!(program = %program, args = args.len(), cwd = %working_directory.display(), "spawning");

    let mut command = Command::new(program);
    command
        .args(args)
        .env_clear()
        .envs(environment.to_map())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !working_directory.as_os_str().is_empty() {
        command.current_dir(working_directory);
    }

    let child = command.spawn().map_err(|source| TaskError::Spawn {
        program: program.clone(),
        source,
    })?;

    tokio::select! {
        output = child.wait_with_output() => {
            let output = output?;
            Ok(ProcessOutput {
                exit_code: output.status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
        _ = cancel.cancelled() => {
            debug!(program = %program, "process cancelled");
            Err(TaskError::Cancelled)
        }
    }
}

/// Run a tool the way task actions do: offer it to the client first, then
/// spawn it locally, forwarding output to `output`.
pub async fn run_tool(
    command_line: &[String],
    environment: &EnvironmentBindings,
    working_directory: &Path,
    dynamic: &dyn DynamicTaskExecutionDelegate,
    client: &dyn ClientDelegate,
    output: &dyn TaskOutputDelegate,
) -> Result<CommandResult> {
    if dynamic.allows_external_tool_execution() {
        if let ExternalToolResult::Result {
            exit_code,
            stdout,
            stderr,
        } = client
            .execute_external_tool(command_line, working_directory, environment)
            .await?
        {
            output.emit_output(&stdout);
            output.emit_output(&stderr);
            return Ok(if exit_code == 0 {
                CommandResult::Succeeded
            } else {
                CommandResult::Failed
            });
        }
    }

    match dynamic.spawn(command_line, environment, working_directory).await {
        Ok(result) => {
            output.emit_output(&result.stdout);
            output.emit_output(&result.stderr);
            if result.success() {
                Ok(CommandResult::Succeeded)
            } else {
                match result.exit_code {
                    Some(code) => output.error(&format!("command exited with code {code}")),
                    None => output.error("command terminated by signal"),
                }
                Ok(CommandResult::Failed)
            }
        }
        Err(TaskError::Cancelled) => Ok(CommandResult::Cancelled),
        Err(e) => Err(e),
    }
}
