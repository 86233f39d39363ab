//! russh client callbacks: host key check and forwarded-tcpip routing

use crate::keys::{fingerprint, HostKey};
use crate::SshError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use russh::client::{self, Msg, Session};
use russh::keys::PublicKey;
use russh::Channel;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Route from a forwarded port to the listener waiting on it
struct Route<S> {
    id: u64,
    incoming: mpsc::UnboundedSender<S>,
}

/// Port-keyed table of live remote listeners
///
/// Shared between the transport, which registers listeners, and the
/// connection handler, which delivers incoming channels.
pub(crate) struct RouteTable<S> {
    routes: DashMap<u32, Route<S>>,
    next_id: AtomicU64,
}

impl<S> RouteTable<S> {
    pub(crate) fn new() -> Self {
        Self {
            routes: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Claim `port`, returning the route id and the receiving end
    ///
    /// Returns `None` if the port already has a listener.
    pub(crate) fn register(&self, port: u32) -> Option<(u64, mpsc::UnboundedReceiver<S>)> {
        match self.routes.entry(port) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = mpsc::unbounded_channel();
                vacant.insert(Route { id, incoming: tx });
                Some((id, rx))
            }
        }
    }

    /// Drop the route for `port` if it still belongs to route `id`
    pub(crate) fn unregister(&self, port: u32, id: u64) -> bool {
        self.routes
            .remove_if(&port, |_, route| route.id == id)
            .is_some()
    }

    /// Hand `stream` to the listener on `port`
    ///
    /// Gives the stream back when no listener takes it.
    pub(crate) fn deliver(&self, port: u32, stream: S) -> Result<(), S> {
        match self.routes.get(&port) {
            Some(route) => route.incoming.send(stream).map_err(|e| e.0),
            None => Err(stream),
        }
    }

    pub(crate) fn clear(&self) {
        self.routes.clear();
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, port: u32) -> bool {
        self.routes.contains_key(&port)
    }
}

pub(crate) type ChannelRoutes = RouteTable<Channel<Msg>>;

/// Connection handler owned by the russh session task
///
/// Dropped when the session ends, which closes every route and marks the
/// transport closed.
pub(crate) struct ForwardHandler {
    host_key: HostKey,
    routes: Arc<ChannelRoutes>,
    closed: CancellationToken,
}

impl ForwardHandler {
    pub(crate) fn new(
        host_key: HostKey,
        routes: Arc<ChannelRoutes>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            host_key,
            routes,
            closed,
        }
    }
}

impl client::Handler for ForwardHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.host_key.verify(server_public_key) {
            debug!("Host key verified");
            return Ok(true);
        }

        let expected = self.host_key.fingerprint();
        let actual = fingerprint(server_public_key);
        warn!(%expected, %actual, "Server presented an unexpected host key");
        Err(SshError::HostKeyMismatch { expected, actual })
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            port = connected_port,
            "Forwarded connection to {}:{} from {}:{}",
            connected_address,
            connected_port,
            originator_address,
            originator_port
        );

        if let Err(channel) = self.routes.deliver(connected_port, channel) {
            info!(port = connected_port, "No listener for forwarded connection");
            if let Err(e) = channel.close().await {
                debug!(port = connected_port, "Failed to close unrouted channel: {}", e);
            }
        }

        Ok(())
    }
}

impl Drop for ForwardHandler {
    fn drop(&mut self) {
        self.routes.clear();
        self.closed.cancel();
    }
}
