//! Devfwd Agent - exposes locally bound TCP ports to a remote peer
//!
//! The agent polls the host for listening sockets and, for every port that
//! appears, asks the remote peer to listen on the same port over a shared
//! transport. Connections the peer receives are relayed to the local
//! service. When the local listener disappears the forward is torn down.
//!
//! # Example Usage
//!
//! ```no_run
//! use devfwd_agent::{Agent, AgentConfig, ProcNetQuery};
//! use devfwd_transport::Transport;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn forward<T: Transport + 'static>(transport: Arc<T>) -> Result<(), devfwd_agent::AgentError> {
//!     let agent = Agent::new(transport, ProcNetQuery::new(), AgentConfig::default());
//!     agent.run(CancellationToken::new()).await
//! }
//! ```
//!
//! # Architecture
//!
//! 1. **Query**: `ProcNetQuery` lists listening endpoints from `/proc/net`
//! 2. **Watch**: `ListenWatcher` diffs consecutive snapshots into events
//! 3. **Register**: `ForwardRegistry` starts or cancels one session per port
//! 4. **Forward**: `ForwardSession` accepts on the remote listener and dials the local port
//! 5. **Relay**: `relay` copies bytes both ways with half-close

mod endpoint;
mod error;
mod procfs;
mod registry;
mod relay;
mod session;
mod watcher;

// Re-export public API
pub use endpoint::{diff, Endpoint, ListenEvent, ListenSnapshot, SnapshotDiff};
pub use error::{AgentError, QueryError, SessionError};
pub use procfs::{parse_table, ListenQuery, ProcNetQuery};
pub use registry::{ForwardRegistry, RegistryConfig};
pub use relay::{relay, RelayStats};
pub use session::{ForwardSession, SessionConfig};
pub use watcher::{ListenWatcher, DEFAULT_POLL_INTERVAL};

use devfwd_transport::Transport;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Interval between two endpoint queries
    pub poll_interval: Duration,

    /// Settings for every forward session
    pub session: SessionConfig,

    /// Ports that are never forwarded
    pub ignored_ports: BTreeSet<u16>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            session: SessionConfig::default(),
            ignored_ports: BTreeSet::new(),
        }
    }
}

/// The forwarding agent: watcher plus registry over one transport
pub struct Agent<T: Transport, Q> {
    transport: Arc<T>,
    query: Q,
    config: AgentConfig,
}

impl<T, Q> Agent<T, Q>
where
    T: Transport + 'static,
    Q: ListenQuery,
{
    pub fn new(transport: Arc<T>, query: Q, config: AgentConfig) -> Self {
        Self {
            transport,
            query,
            config,
        }
    }

    /// Forward ports until `cancel` fires or the endpoint query fails
    ///
    /// All forward sessions have stopped when this returns.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), AgentError> {
        let mut watcher = ListenWatcher::new(self.query, self.config.poll_interval);
        let mut registry = ForwardRegistry::new(
            self.transport,
            RegistryConfig {
                session: self.config.session,
                ignored_ports: self.config.ignored_ports,
            },
            &cancel,
        );

        tracing::info!(
            poll_interval_ms = watcher.poll_interval().as_millis() as u64,
            "Watching for listening ports"
        );

        registry.run(&mut watcher, &cancel).await?;
        Ok(())
    }
}
