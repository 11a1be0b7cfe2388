//! Bounded shell-outs.
//!
//! Disk enumeration and mounting lean on OS utilities (`lsblk`, `blkid`,
//! `mount`, `powershell`). Every call goes through a [`CommandRunner`] so it
//! is bounded by a timeout and yields a typed [`CommandError`] instead of a
//! panic or a silently swallowed failure.

use std::{io, process::Stdio, time::Duration};

use thiserror::Error;
use tokio::process::Command;

use crate::rt::block_on;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command `{program}` not found, check PATH")]
    NotFound { program: String },

    #[error("permission denied while running `{program}`")]
    PermissionDenied { program: String },

    #[error("`{program}` did not finish within {}s", .timeout.as_secs_f32())]
    TimedOut { program: String, timeout: Duration },

    #[error("`{program}` failed ({status}): {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("failed to run `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to drive `{program}`: {message}")]
    Runtime { program: String, message: String },
}

impl CommandError {
    fn from_io(program: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => CommandError::NotFound {
                program: program.to_string(),
            },
            io::ErrorKind::PermissionDenied => CommandError::PermissionDenied {
                program: program.to_string(),
            },
            _ => CommandError::Io {
                program: program.to_string(),
                source,
            },
        }
    }
}

/// Runs external programs. Implemented by [`SystemRunner`] and by fakes in tests.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError>;
}

/// Spawns real processes through tokio, killing them when the timeout expires.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        tracing::debug!("Running command: {}", command_line(program, args));

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = block_on(async { tokio::time::timeout(timeout, command.output()).await })
            .map_err(|e| CommandError::Runtime {
                program: program.to_string(),
                message: e.to_string(),
            })?;

        let output = match output {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(CommandError::from_io(program, source)),
            Err(_) => {
                return Err(CommandError::TimedOut {
                    program: program.to_string(),
                    timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(CommandError::Failed {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr,
            });
        }

        if !stdout.trim().is_empty() {
            tracing::trace!("{program} stdout: {}", stdout.trim());
        }
        Ok(CommandOutput { stdout, stderr })
    }
}

pub fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}
