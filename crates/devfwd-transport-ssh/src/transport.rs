//! `Transport` over a single SSH connection using tcpip-forward

use crate::handler::{ChannelRoutes, ForwardHandler, RouteTable};
use crate::keys::{ClientKey, HostKey};
use crate::owner::{spawn_handle_owner, HandleController};
use crate::SshError;
use async_trait::async_trait;
use devfwd_transport::{RemoteListener, Transport, TransportError, TransportResult};
use russh::client::{self, Msg};
use russh::{Channel, ChannelStream};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_MAX: usize = 3;

/// How to reach and authenticate to the forwarding server
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Unix socket the server listens on
    pub socket_path: PathBuf,
    /// User name to authenticate as
    pub user: String,
    /// The only host key the server may present
    pub host_key: HostKey,
    /// Identity to authenticate with
    pub client_key: ClientKey,
}

/// An authenticated SSH connection able to open remote listeners
#[derive(Clone)]
pub struct SshTransport {
    controller: HandleController,
    routes: Arc<ChannelRoutes>,
    closed: CancellationToken,
}

impl SshTransport {
    /// Dial the server socket, verify its host key and authenticate
    pub async fn connect(config: SshConfig) -> Result<Self, SshError> {
        info!(socket = %config.socket_path.display(), "Dial server");

        let stream = UnixStream::connect(&config.socket_path)
            .await
            .map_err(|e| {
                SshError::Connect(format!("{}: {}", config.socket_path.display(), e))
            })?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        };

        let routes = Arc::new(RouteTable::new());
        let closed = CancellationToken::new();
        let handler =
            ForwardHandler::new(config.host_key.clone(), routes.clone(), closed.clone());

        let mut handle = client::connect_stream(Arc::new(ssh_config), stream, handler).await?;
        debug!("SSH handshake completed");

        let authenticated = handle
            .authenticate_publickey(&config.user, config.client_key.auth_material())
            .await?;
        if !authenticated.success() {
            return Err(SshError::AuthenticationRejected(config.user));
        }
        info!(user = %config.user, "SSH authentication successful");

        let controller = spawn_handle_owner(handle, closed.clone());

        Ok(Self {
            controller,
            routes,
            closed,
        })
    }

    /// Resolves once the SSH connection is gone
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Close the connection
    pub async fn disconnect(&self) {
        self.controller.disconnect().await;
        self.closed.cancelled().await;
    }
}

impl fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTransport")
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl Transport for SshTransport {
    type Listener = SshListener;

    async fn open_remote_listener(&self, port: u16) -> TransportResult<SshListener> {
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }

        // Route first, so channels arriving right after the reply are kept
        let remote_port = u32::from(port);
        let (id, incoming) = self.routes.register(remote_port).ok_or_else(|| {
            TransportError::ListenFailed {
                port,
                reason: "port already forwarded".to_string(),
            }
        })?;

        // Dropping this mid-request unroutes and cancels the forward
        let mut listener = SshListener {
            port,
            id,
            incoming,
            routes: self.routes.clone(),
            controller: self.controller.clone(),
            open: true,
        };

        if let Err(e) = self.controller.tcpip_forward(remote_port).await {
            listener.unroute();
            return Err(TransportError::ListenFailed {
                port,
                reason: e.to_string(),
            });
        }

        debug!(port, "Remote listener opened");
        Ok(listener)
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// A remote port the server listens on for us
pub struct SshListener {
    port: u16,
    id: u64,
    incoming: mpsc::UnboundedReceiver<Channel<Msg>>,
    routes: Arc<ChannelRoutes>,
    controller: HandleController,
    open: bool,
}

impl SshListener {
    /// Stop routing; returns false if already done
    fn unroute(&mut self) -> bool {
        if !self.open {
            return false;
        }
        self.open = false;
        self.routes.unregister(u32::from(self.port), self.id);
        self.incoming.close();
        true
    }
}

impl fmt::Debug for SshListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshListener")
            .field("port", &self.port)
            .field("open", &self.open)
            .finish()
    }
}

#[async_trait]
impl RemoteListener for SshListener {
    type Stream = ChannelStream<Msg>;

    async fn accept(&mut self) -> TransportResult<ChannelStream<Msg>> {
        self.incoming
            .recv()
            .await
            .map(Channel::into_stream)
            .ok_or(TransportError::ListenerClosed)
    }

    async fn close(&mut self) {
        if !self.unroute() {
            return;
        }
        if let Err(e) = self.controller.cancel_tcpip_forward(u32::from(self.port)).await {
            warn!(port = self.port, "Failed to cancel remote forward: {}", e);
        }
        debug!(port = self.port, "Remote listener closed");
    }

    fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for SshListener {
    fn drop(&mut self) {
        if self.unroute() {
            self.controller.cancel_tcpip_forward_detached(u32::from(self.port));
        }
    }
}
