use std::path::PathBuf;
use thiserror::Error;

/// Errors from bootstrapping or running the SSH transport
#[derive(Error, Debug)]
pub enum SshError {
    #[error("Key error: {0}")]
    Key(String),

    #[error("Invalid host key {}: {reason}", .path.display())]
    HostKey { path: PathBuf, reason: String },

    #[error("Host key mismatch: server presented {actual}, expected {expected}")]
    HostKeyMismatch { expected: String, actual: String },

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Authentication rejected by server for user {0}")]
    AuthenticationRejected(String),

    #[error("Waiting for server failed: {0}")]
    Rendezvous(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,

    #[error("Could not find a free key file name in {} after {attempts} attempts", .dir.display())]
    KeyDropExhausted { dir: PathBuf, attempts: usize },
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Protocol(err.to_string())
    }
}
