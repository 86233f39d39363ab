use devfwd_transport::TransportError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from enumerating locally bound endpoints
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed socket table: {0}")]
    Parse(String),
}

/// Errors that end a single forward session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to open remote listener on port {port}: {source}")]
    Listen { port: u16, source: TransportError },

    #[error("Accept failed on port {port}: {source}")]
    Accept { port: u16, source: TransportError },
}

impl SessionError {
    pub fn port(&self) -> u16 {
        match self {
            SessionError::Listen { port, .. } | SessionError::Accept { port, .. } => *port,
        }
    }
}

/// Errors that stop the whole agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Listen query failed: {0}")]
    Query(#[from] QueryError),
}
