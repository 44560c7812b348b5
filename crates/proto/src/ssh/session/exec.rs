//! One-shot commands over a session channel.

use crate::ssh::channel::Channel;
use crate::ssh::transport::Transport;
use tessera_platform::TesseraResult;
use tracing::debug;

/// Everything a finished command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CommandOutput {
    /// Bytes written to stdout
    pub stdout: Vec<u8>,
    /// Bytes written to stderr
    pub stderr: Vec<u8>,
    /// Exit status, if the server sent one
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    /// True when the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// Stdout as text, with invalid UTF-8 replaced.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

impl Transport {
    /// Runs `command` on a fresh session channel and collects its output.
    ///
    /// Stdout and stderr are drained concurrently so that a command filling
    /// one stream cannot stall on the other's window.
    pub async fn run_command(&self, command: &str) -> TesseraResult<CommandOutput> {
        let channel = self.open_session().await?;
        channel.exec(command).await?;
        channel.shutdown_write().await?;

        let (stdout, stderr) = tokio::try_join!(channel.read_to_end(), channel.read_stderr_to_end())?;
        let exit_status = channel.recv_exit_status().await?;
        channel.close().await?;

        debug!(command, ?exit_status, stdout = stdout.len(), "Command finished");
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_status,
        })
    }

    /// Opens a session channel and starts subsystem `name` on it.
    pub async fn open_subsystem(&self, name: &str) -> TesseraResult<Channel> {
        let channel = self.open_session().await?;
        if let Err(e) = channel.subsystem(name).await {
            let _ = channel.close().await;
            return Err(e);
        }
        Ok(channel)
    }
}
