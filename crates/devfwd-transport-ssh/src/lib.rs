//! SSH transport for devfwd
//!
//! Implements [`devfwd_transport::Transport`] on top of one russh client
//! connection. Each remote listener is an SSH `tcpip-forward` request bound
//! to `0.0.0.0:<port>` on the server; the `forwarded-tcpip` channels the
//! server opens for it are handed out by [`SshListener::accept`].
//!
//! Bootstrapping the connection takes three steps:
//!
//! 1. [`Rendezvous::wait`] until the server has published its socket and host key
//! 2. [`ClientKey::generate`] an ephemeral identity and [`AuthorizedKeyDrop::store`] it
//!    where the server picks up authorized keys
//! 3. [`SshTransport::connect`] over the Unix socket, trusting only the
//!    published [`HostKey`]

mod error;
mod handler;
mod keys;
mod owner;
mod rendezvous;
mod transport;

pub use error::SshError;
pub use keys::{AuthorizedKeyDrop, ClientKey, HostKey, KEY_DROP_ATTEMPTS};
pub use rendezvous::Rendezvous;
pub use transport::{SshConfig, SshListener, SshTransport};
