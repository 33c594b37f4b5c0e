use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub const DEFAULT_COMMAND_TOKEN: &str = "sleap-label";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Runs the external program behind a recognised command token.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Returns the command's captured stdout.
    async fn run(&self, token: &str) -> Result<String, CommandError>;
}

/// Launches the token as a program on the local host.
#[derive(Debug, Default, Clone)]
pub struct ProcessCommandRunner;

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, token: &str) -> Result<String, CommandError> {
        debug!(command = token, "launching external command");
        let output = Command::new(token)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                command: token.to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(CommandError::Failed {
                command: token.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .trim_end()
            .to_string())
    }
}
