//! Transport abstraction layer for port forwarding
//!
//! The forwarding engine only needs two things from the connection to the
//! remote peer: the ability to ask the peer to listen on a port, and the
//! ability to accept the connections the peer receives on it. This crate
//! captures exactly that as traits, so the engine does not depend on SSH or
//! any other concrete protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   devfwd-agent                           │
//! │      (watcher, registry, forward sessions, relay)        │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            devfwd-transport (this crate)                 │
//! │  - Transport            - RemoteListener                 │
//! │  - TransportStream      - mock::MemoryTransport          │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │                 devfwd-transport-ssh                     │
//! │     (tcpip-forward over a single SSH connection)         │
//! └─────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to listen on remote port {port}: {reason}")]
    ListenFailed { port: u16, reason: String },

    #[error("Remote listener closed")]
    ListenerClosed,

    #[error("Transport disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A byte stream carried over the transport
///
/// Shutting down the write side must signal end-of-data to the peer while
/// leaving the read side usable.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A listener the remote peer holds open on our behalf
#[async_trait]
pub trait RemoteListener: Send + Debug {
    /// The stream type produced for each accepted connection
    type Stream: TransportStream;

    /// Wait for the next connection the remote peer received on this port
    ///
    /// Returns an error once the listener is closed or the transport is gone.
    async fn accept(&mut self) -> TransportResult<Self::Stream>;

    /// Stop listening on the remote side
    ///
    /// Pending and future `accept` calls fail after this returns.
    async fn close(&mut self);

    /// The port the remote peer is listening on
    fn port(&self) -> u16;
}

/// An established, authenticated connection to the remote peer
///
/// Implementations must tolerate concurrent use: many forward sessions open
/// listeners and accept on them at the same time.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// The listener type opened by this transport
    type Listener: RemoteListener + 'static;

    /// Ask the remote peer to listen on `port` and route its connections to us
    async fn open_remote_listener(&self, port: u16) -> TransportResult<Self::Listener>;

    /// Check if the underlying connection is gone
    fn is_closed(&self) -> bool;
}
