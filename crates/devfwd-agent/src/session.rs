//! One forwarded port: remote listener, accept loop, and per-connection relays

use crate::error::SessionError;
use crate::relay::relay;
use devfwd_transport::{RemoteListener, Transport, TransportError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settings shared by every forward session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Host the local service is dialed on
    pub local_host: IpAddr,
    /// Upper bound for dialing the local service
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Forwards one port from the remote peer to the local service
pub struct ForwardSession<T: Transport> {
    transport: Arc<T>,
    port: u16,
    config: SessionConfig,
}

impl<T: Transport + 'static> ForwardSession<T> {
    pub fn new(transport: Arc<T>, port: u16, config: SessionConfig) -> Self {
        Self {
            transport,
            port,
            config,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run until `cancel` fires or the listener fails
    ///
    /// Every accepted connection is relayed on its own task. Before returning,
    /// the remote listener is closed and all in-flight relays are drained.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), SessionError> {
        let port = self.port;
        info!(port, "Begin forward");

        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                info!(port, "Done forward");
                return Ok(());
            }
            result = self.transport.open_remote_listener(port) => result,
        };
        let mut listener = opened.map_err(|source| SessionError::Listen { port, source })?;

        let target = SocketAddr::new(self.config.local_host, port);
        let drain = cancel.child_token();
        let mut connections = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        debug!(port, active = connections.len() + 1, "Accepted connection");
                        connections.spawn(handle_connection(
                            stream,
                            target,
                            self.config.connect_timeout,
                            drain.clone(),
                        ));
                    }
                    Err(source) => break Err(source),
                },
            }
        };

        listener.close().await;
        drain.cancel();
        while connections.join_next().await.is_some() {}

        info!(port, "Done forward");
        outcome.map_err(|source: TransportError| SessionError::Accept { port, source })
    }
}

async fn handle_connection<S>(
    inbound: S,
    target: SocketAddr,
    connect_timeout: Duration,
    cancel: CancellationToken,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send,
{
    let dial = tokio::time::timeout(connect_timeout, TcpStream::connect(target));
    let outbound = tokio::select! {
        _ = cancel.cancelled() => return,
        dialed = dial => match dialed {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(%target, "Failed to connect to local service: {}", e);
                return;
            }
            Err(_) => {
                warn!(%target, timeout = ?connect_timeout, "Timed out connecting to local service");
                return;
            }
        },
    };
    let _ = outbound.set_nodelay(true);

    let stats = relay(&cancel, inbound, outbound).await;
    debug!(
        %target,
        bytes_to_local = stats.a_to_b,
        bytes_to_remote = stats.b_to_a,
        cancelled = stats.cancelled,
        "Connection closed"
    );
}
