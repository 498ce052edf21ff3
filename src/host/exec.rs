//! External command execution
//!
//! The host side drives OS tooling (`iscsiadm`, `multipath`, `blkid`,
//! `mount`, resize tools) through this seam so tests can script the
//! tooling without a real kernel underneath.

use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::debug;

/// Port for running external OS tools.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and return its stdout.
    ///
    /// A non-zero exit maps to [`Error::CommandFailed`] carrying the exit
    /// code and combined output.
    async fn run(&self, program: &str, args: &[&str]) -> Result<String>;
}

/// Runs commands on the local system via `tokio::process`.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!("exec: {} {}", program, args.join(" "));

        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::CommandFailed {
                program: program.to_string(),
                code: None,
                output: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::CommandFailed {
                program: program.to_string(),
                code: output.status.code(),
                output: format!("{}{}", stdout, stderr),
            })
        }
    }
}

/// Exit code a command error carries, if the process ran at all.
pub fn exit_code(err: &Error) -> Option<i32> {
    match err {
        Error::CommandFailed { code, .. } => *code,
        _ => None,
    }
}
