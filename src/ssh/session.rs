//! Established SSH connections
//!
//! An [`SshConnection`] is what the pool hands out: an authenticated
//! transport whose `Handle` lives in the owner task, plus the facts recorded
//! while establishing it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use russh::ChannelMsg;
use serde::Serialize;
use tracing::{debug, warn};

use super::auth::AuthOutcome;
use super::config::TargetIdentity;
use super::connection_pool::PooledTransport;
use super::error::SshError;
use super::handle_owner::HandleController;

/// Command used by the liveness probe; any POSIX shell has it.
const PROBE_COMMAND: &str = "true";

/// Captured result of one remote command
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the server closed the channel without an exit status
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Authenticated connection to one target
pub struct SshConnection {
    identity: TargetIdentity,
    controller: HandleController,
    auth_outcome: AuthOutcome,
    host_key_fingerprint: Option<String>,
    connected_at: DateTime<Utc>,
}

impl SshConnection {
    pub fn new(
        identity: TargetIdentity,
        controller: HandleController,
        auth_outcome: AuthOutcome,
        host_key_fingerprint: Option<String>,
    ) -> Self {
        Self {
            identity,
            controller,
            auth_outcome,
            host_key_fingerprint,
            connected_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> &TargetIdentity {
        &self.identity
    }

    /// Method that authenticated this connection
    pub fn auth_outcome(&self) -> AuthOutcome {
        self.auth_outcome
    }

    pub fn host_key_fingerprint(&self) -> Option<&str> {
        self.host_key_fingerprint.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Run `command` on a fresh session channel and collect its output.
    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SshError> {
        tokio::time::timeout(timeout, exec_on_controller(&self.controller, command))
            .await
            .map_err(|_| {
                SshError::Timeout(format!(
                    "command on {} did not finish within {:?}",
                    self.identity, timeout
                ))
            })?
    }
}

/// Open a session channel, exec `command` and read until the channel closes.
pub async fn exec_on_controller(
    controller: &HandleController,
    command: &str,
) -> Result<CommandOutput, SshError> {
    let mut channel = controller.open_session_channel().await?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| SshError::ChannelError(format!("exec request failed: {}", e)))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext } => {
                // ext 1 is stderr
                if ext == 1 {
                    stderr.extend_from_slice(&data);
                }
            }
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            ChannelMsg::Eof => {}
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_status,
    })
}

#[async_trait]
impl PooledTransport for SshConnection {
    /// Full request/response round trip: a no-op command has to come back
    /// with exit status 0 before `timeout` elapses.
    async fn probe(&self, timeout: Duration) -> Result<(), SshError> {
        if !self.controller.is_connected() {
            return Err(SshError::Disconnected);
        }
        let output = self.exec(PROBE_COMMAND, timeout).await?;
        match output.exit_status {
            Some(0) => {
                debug!("Probe ok for {}", self.identity);
                Ok(())
            }
            other => {
                warn!("Probe of {} returned {:?}", self.identity, other);
                Err(SshError::ChannelError(format!(
                    "probe command exited with {:?}",
                    other
                )))
            }
        }
    }

    async fn close(&self) -> Result<(), SshError> {
        self.controller.disconnect().await
    }

    fn auth_outcome(&self) -> AuthOutcome {
        self.auth_outcome
    }
}
