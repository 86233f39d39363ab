//! Port to forward-session bookkeeping

use crate::endpoint::{Endpoint, ListenEvent};
use crate::error::{QueryError, SessionError};
use crate::procfs::ListenQuery;
use crate::session::{ForwardSession, SessionConfig};
use crate::watcher::ListenWatcher;
use devfwd_transport::Transport;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settings for the registry and the sessions it starts
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub session: SessionConfig,
    /// Ports that are never forwarded
    pub ignored_ports: BTreeSet<u16>,
}

/// A running forward session, owned by the registry
#[derive(Debug)]
struct ForwardHandle {
    id: u64,
    cancel: CancellationToken,
    /// Bound endpoints sharing this port, e.g. `0.0.0.0` and `[::]`
    endpoints: BTreeSet<Endpoint>,
}

/// How a session task ended
#[derive(Debug)]
struct SessionExit {
    port: u16,
    id: u64,
    result: Result<(), SessionError>,
}

/// Maps each forwarded port to its running session
///
/// All mutation goes through [`ForwardRegistry::handle_event`] and
/// [`ForwardRegistry::shutdown`], both taking `&mut self`.
pub struct ForwardRegistry<T: Transport> {
    transport: Arc<T>,
    config: RegistryConfig,
    scope: CancellationToken,
    forwards: HashMap<u16, ForwardHandle>,
    sessions: JoinSet<SessionExit>,
    next_id: u64,
}

impl<T: Transport + 'static> ForwardRegistry<T> {
    /// Create a registry whose sessions live inside a child of `parent`
    pub fn new(transport: Arc<T>, config: RegistryConfig, parent: &CancellationToken) -> Self {
        Self {
            transport,
            config,
            scope: parent.child_token(),
            forwards: HashMap::new(),
            sessions: JoinSet::new(),
            next_id: 0,
        }
    }

    /// Check if `port` currently has a registered session
    pub fn is_forwarding(&self, port: u16) -> bool {
        self.forwards.contains_key(&port)
    }

    /// Registered ports, ascending
    pub fn active_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.forwards.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn forward_count(&self) -> usize {
        self.forwards.len()
    }

    /// Apply one listen event
    pub fn handle_event(&mut self, event: ListenEvent) {
        self.reap_finished();

        let port = event.port();
        if self.config.ignored_ports.contains(&port) {
            debug!(port, "Ignoring {}", event);
            return;
        }

        match event {
            ListenEvent::Added(endpoint) => {
                info!(endpoint = %endpoint, "Listen added");
                self.start(endpoint);
            }
            ListenEvent::Removed(endpoint) => {
                info!(endpoint = %endpoint, "Listen removed");
                self.stop(endpoint);
            }
        }
    }

    fn start(&mut self, endpoint: Endpoint) {
        let port = endpoint.port;
        if let Some(handle) = self.forwards.get_mut(&port) {
            info!(port, "Duplicate port");
            handle.endpoints.insert(endpoint);
            return;
        }

        let id = self.next_id;
        self.next_id += 1;

        let cancel = self.scope.child_token();
        self.forwards.insert(
            port,
            ForwardHandle {
                id,
                cancel: cancel.clone(),
                endpoints: BTreeSet::from([endpoint]),
            },
        );

        let session =
            ForwardSession::new(self.transport.clone(), port, self.config.session.clone());
        self.sessions.spawn(async move {
            let result = session.run(cancel).await;
            SessionExit { port, id, result }
        });
    }

    /// Cancel the session once no endpoint is left on the port
    fn stop(&mut self, endpoint: Endpoint) {
        let port = endpoint.port;
        let Some(handle) = self.forwards.get_mut(&port) else {
            debug!(port, "No forward registered");
            return;
        };

        handle.endpoints.remove(&endpoint);
        if !handle.endpoints.is_empty() {
            debug!(port, remaining = handle.endpoints.len(), "Port still bound");
            return;
        }

        if let Some(handle) = self.forwards.remove(&port) {
            handle.cancel.cancel();
        }
    }

    /// Collect sessions that already ended and drop their handles
    fn reap_finished(&mut self) {
        while let Some(joined) = self.sessions.try_join_next() {
            match joined {
                Ok(exit) => self.retire(exit),
                Err(e) => warn!("Forward session task failed: {}", e),
            }
        }
    }

    fn retire(&mut self, exit: SessionExit) {
        if let Err(e) = &exit.result {
            warn!(port = exit.port, "Forward ended: {}", e);
        }
        if self
            .forwards
            .get(&exit.port)
            .is_some_and(|handle| handle.id == exit.id)
        {
            self.forwards.remove(&exit.port);
        }
    }

    /// Cancel every session and wait for all of them to stop
    pub async fn shutdown(&mut self) {
        self.scope.cancel();
        for (_, handle) in self.forwards.drain() {
            handle.cancel.cancel();
        }

        while let Some(joined) = self.sessions.join_next().await {
            match joined {
                Ok(exit) => {
                    if let Err(e) = exit.result {
                        warn!(port = exit.port, "Forward ended: {}", e);
                    }
                }
                Err(e) => warn!("Forward session task failed: {}", e),
            }
        }
    }

    /// Drive the registry from `watcher` until `cancel` fires or the query fails
    ///
    /// Every session is stopped before this returns.
    pub async fn run<Q: ListenQuery>(
        &mut self,
        watcher: &mut ListenWatcher<Q>,
        cancel: &CancellationToken,
    ) -> Result<(), QueryError> {
        let watched = watcher
            .watch(cancel, |event| self.handle_event(event))
            .await;
        self.shutdown().await;
        watched
    }
}
