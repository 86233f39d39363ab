//! In-memory transport for tests
//!
//! `MemoryTransport` plays both roles of a forwarding pair inside one
//! process: consumers open remote listeners through the [`Transport`] trait,
//! and tests act as the remote peer with [`MemoryTransport::connect`].

use super::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug)]
struct Route {
    id: u64,
    incoming: mpsc::UnboundedSender<DuplexStream>,
}

#[derive(Debug, Default)]
struct Inner {
    routes: Mutex<HashMap<u16, Route>>,
    failing: Mutex<HashSet<u16>>,
    opened: Mutex<HashMap<u16, usize>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn remove_route(&self, port: u16, id: u64) {
        if let Ok(mut routes) = self.routes.lock() {
            if routes.get(&port).is_some_and(|route| route.id == id) {
                routes.remove(&port);
            }
        }
    }
}

/// Mock transport backed by `tokio::io::duplex` pipes
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future `open_remote_listener(port)` fail
    pub fn fail_listen(&self, port: u16) {
        if let Ok(mut failing) = self.inner.failing.lock() {
            failing.insert(port);
        }
    }

    /// Act as the remote peer: open a connection to the listener on `port`
    ///
    /// Returns the peer's end of the pipe.
    pub fn connect(&self, port: u16) -> TransportResult<DuplexStream> {
        let routes = self
            .inner
            .routes
            .lock()
            .map_err(|_| TransportError::Protocol("route table poisoned".to_string()))?;
        let route = routes.get(&port).ok_or(TransportError::ListenerClosed)?;

        let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
        route
            .incoming
            .send(local)
            .map_err(|_| TransportError::ListenerClosed)?;
        Ok(remote)
    }

    /// Check if a listener is currently open on `port`
    pub fn is_listening(&self, port: u16) -> bool {
        self.inner
            .routes
            .lock()
            .map(|routes| routes.contains_key(&port))
            .unwrap_or(false)
    }

    /// Number of successful `open_remote_listener` calls for `port`
    pub fn open_count(&self, port: u16) -> usize {
        self.inner
            .opened
            .lock()
            .map(|opened| opened.get(&port).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Ports with an open listener
    pub fn listening_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .inner
            .routes
            .lock()
            .map(|routes| routes.keys().copied().collect())
            .unwrap_or_default();
        ports.sort_unstable();
        ports
    }

    /// Simulate losing the connection: every listener stops accepting
    pub fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Ok(mut routes) = self.inner.routes.lock() {
            routes.clear();
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Listener = MemoryListener;

    async fn open_remote_listener(&self, port: u16) -> TransportResult<MemoryListener> {
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }

        let fails = self
            .inner
            .failing
            .lock()
            .map(|failing| failing.contains(&port))
            .unwrap_or(false);
        if fails {
            return Err(TransportError::ListenFailed {
                port,
                reason: "rejected by mock".to_string(),
            });
        }

        let mut routes = self
            .inner
            .routes
            .lock()
            .map_err(|_| TransportError::Protocol("route table poisoned".to_string()))?;
        if routes.contains_key(&port) {
            return Err(TransportError::ListenFailed {
                port,
                reason: "port already forwarded".to_string(),
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(port, Route { id, incoming: tx });
        drop(routes);

        if let Ok(mut opened) = self.inner.opened.lock() {
            *opened.entry(port).or_insert(0) += 1;
        }

        tracing::debug!(port, "Mock remote listener opened");

        Ok(MemoryListener {
            port,
            id,
            incoming: rx,
            inner: self.inner.clone(),
        })
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Listener half of [`MemoryTransport`]
#[derive(Debug)]
pub struct MemoryListener {
    port: u16,
    id: u64,
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
    inner: Arc<Inner>,
}

#[async_trait]
impl RemoteListener for MemoryListener {
    type Stream = DuplexStream;

    async fn accept(&mut self) -> TransportResult<DuplexStream> {
        self.incoming
            .recv()
            .await
            .ok_or(TransportError::ListenerClosed)
    }

    async fn close(&mut self) {
        self.inner.remove_route(self.port, self.id);
        self.incoming.close();
        tracing::debug!(port = self.port, "Mock remote listener closed");
    }

    fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.inner.remove_route(self.port, self.id);
    }
}
