//! Single owner task for the russh client handle
//!
//! Only one task holds `Handle<ForwardHandler>`. Everything else talks to it
//! through [`HandleController`], which sends commands over an mpsc channel
//! and waits for the reply on a oneshot.

use crate::handler::ForwardHandler;
use crate::SshError;
use russh::client::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Address every remote listener binds to
pub(crate) const FORWARD_BIND_ADDRESS: &str = "0.0.0.0";

const COMMAND_QUEUE_SIZE: usize = 64;

pub(crate) enum HandleCommand {
    /// Request remote forward (tcpip-forward)
    TcpipForward {
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel remote forward
    CancelTcpipForward {
        port: u32,
        reply_tx: Option<oneshot::Sender<Result<(), russh::Error>>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

#[derive(Debug, Clone)]
pub(crate) struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    pub(crate) async fn tcpip_forward(&self, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward { port, reply_tx })
            .await
            .map_err(|_| SshError::Protocol("SSH connection closed".to_string()))?;

        reply_rx
            .await
            .map_err(|_| SshError::Protocol("SSH connection closed".to_string()))?
            .map_err(SshError::from)
    }

    pub(crate) async fn cancel_tcpip_forward(&self, port: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                port,
                reply_tx: Some(reply_tx),
            })
            .await
            .map_err(|_| SshError::Protocol("SSH connection closed".to_string()))?;

        reply_rx
            .await
            .map_err(|_| SshError::Protocol("SSH connection closed".to_string()))?
            .map_err(SshError::from)
    }

    /// Queue a cancel without waiting for it, for use from `Drop`
    pub(crate) fn cancel_tcpip_forward_detached(&self, port: u32) {
        let _ = self.cmd_tx.try_send(HandleCommand::CancelTcpipForward {
            port,
            reply_tx: None,
        });
    }

    pub(crate) async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }
}

/// Move `handle` into its owner task
///
/// The task ends on `Disconnect`, when every controller is dropped, or when
/// `closed` fires because the session went away.
pub(crate) fn spawn_handle_owner(
    handle: Handle<ForwardHandler>,
    closed: CancellationToken,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(COMMAND_QUEUE_SIZE);

    tokio::spawn(async move {
        let mut handle = handle;
        debug!("Handle owner task started");

        loop {
            let cmd = tokio::select! {
                _ = closed.cancelled() => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            match cmd {
                HandleCommand::TcpipForward { port, reply_tx } => {
                    let result = handle.tcpip_forward(FORWARD_BIND_ADDRESS, port).await;
                    if let Ok(bound) = result {
                        if reply_tx.send(result).is_err() {
                            // Caller gave up; do not leave the forward behind
                            warn!(port = bound, "Cancelling orphaned remote forward");
                            let _ = handle
                                .cancel_tcpip_forward(FORWARD_BIND_ADDRESS, bound)
                                .await;
                        }
                    } else {
                        let _ = reply_tx.send(result);
                    }
                }

                HandleCommand::CancelTcpipForward { port, reply_tx } => {
                    let result = handle.cancel_tcpip_forward(FORWARD_BIND_ADDRESS, port).await;
                    match reply_tx {
                        Some(reply_tx) => {
                            let _ = reply_tx.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                debug!(port, "cancel-tcpip-forward failed: {}", e);
                            }
                        }
                    }
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested");
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Agent stopped", "en")
            .await;
        closed.cancel();
        debug!("Handle owner task terminated");
    });

    HandleController { cmd_tx }
}

/// Fail every queued command with `Disconnect`
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                if let Some(reply_tx) = reply_tx {
                    let _ = reply_tx.send(Err(russh::Error::Disconnect));
                }
            }
            HandleCommand::Disconnect => {}
        }
    }
}
