//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to it
//! through a [`HandleController`], which sends commands over an mpsc channel
//! and waits on a oneshot reply. Concurrent users of one pooled connection
//! therefore never hold a lock across `.await`.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, identity.to_string());
//! let channel = controller.open_session_channel().await?;
//! controller.disconnect().await?;
//! ```

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (exec, probe)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect and stop the task; replies once the disconnect was sent
    Disconnect {
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },
}

/// Cloneable handle to the owner task.
///
/// Any holder has full control of the connection, including disconnecting
/// it. Keep it in-process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Controller over a raw command channel; production code uses
    /// [`spawn_handle_owner_task`].
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| match e {
                russh::Error::Disconnect | russh::Error::HUP => SshError::Disconnected,
                other => SshError::ChannelError(other.to_string()),
            })
    }

    /// Disconnect the SSH connection.
    ///
    /// Succeeds when the task is already gone; fails only if the disconnect
    /// message itself could not be delivered.
    pub async fn disconnect(&self) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Disconnect { reply_tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        match reply_rx.await {
            Ok(result) => result.map_err(SshError::from),
            Err(_) => Ok(()),
        }
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task, consuming `handle`.
///
/// `label` only appears in logs.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let handle = handle;
        info!("Handle owner task started for {}", label);

        let mut disconnect_reply = None;
        loop {
            match cmd_rx.recv().await {
                Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        // Channel is dropped here; the server closes its end
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }
                Some(HandleCommand::Disconnect { reply_tx }) => {
                    info!("Disconnect requested for {}", label);
                    disconnect_reply = Some(reply_tx);
                    break;
                }
                None => {
                    debug!("All controllers dropped for {}", label);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let result = handle
            .disconnect(russh::Disconnect::ByApplication, "Connection closed", "en")
            .await;
        if let Err(e) = &result {
            warn!("Disconnect of {} was not clean: {}", label, e);
        }
        if let Some(reply_tx) = disconnect_reply {
            let _ = reply_tx.send(result);
        }
        info!("Handle owner task terminated for {}", label);
    });

    HandleController::new(cmd_tx)
}

/// Close the queue and answer every command still in it
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect { reply_tx } => {
                let _ = reply_tx.send(Ok(()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_owner_reports_disconnected() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        drop(cmd_rx);

        assert!(!controller.is_connected());
        let err = controller.open_session_channel().await.err().unwrap();
        assert!(matches!(err, SshError::Disconnected));
        // Disconnecting a gone connection is not an error
        assert!(controller.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_drain_answers_pending_commands() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);

        let opener = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.open_session_channel().await })
        };
        let closer = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.disconnect().await })
        };

        // Wait until both commands are queued
        while cmd_rx.len() < 2 {
            tokio::task::yield_now().await;
        }
        drain_pending_commands(&mut cmd_rx);

        let opened = opener.await.unwrap();
        assert!(matches!(opened.err(), Some(SshError::Disconnected)));
        assert!(closer.await.unwrap().is_ok());
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_reply_error_is_surfaced() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);

        tokio::spawn(async move {
            if let Some(HandleCommand::Disconnect { reply_tx }) = cmd_rx.recv().await {
                let _ = reply_tx.send(Err(russh::Error::Inconsistent));
            }
        });

        let err = controller.disconnect().await.unwrap_err();
        assert_ne!(err.kind(), crate::ssh::error::ErrorKind::Config);
    }
}
