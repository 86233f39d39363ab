//! Waiting for the server side to publish its socket and host key
//!
//! Both sides share a data directory:
//!
//! ```text
//! <datadir>/
//!   server/rsa_hostkey.pub   host key the server will present
//!   server/ssh.sock          server's listening socket
//!   client/                  authorized keys dropped by the agent
//! ```

use crate::SshError;
use notify::{RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const SERVER_DIR: &str = "server";
const CLIENT_DIR: &str = "client";
const HOST_KEY_FILE: &str = "rsa_hostkey.pub";
const SOCKET_FILE: &str = "ssh.sock";

/// Paths inside the shared data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    server_dir: PathBuf,
    host_key_path: PathBuf,
    socket_path: PathBuf,
    authorized_keys_dir: PathBuf,
}

impl Rendezvous {
    pub fn new(datadir: impl AsRef<Path>) -> Self {
        let datadir = datadir.as_ref();
        let server_dir = datadir.join(SERVER_DIR);
        Self {
            host_key_path: server_dir.join(HOST_KEY_FILE),
            socket_path: server_dir.join(SOCKET_FILE),
            authorized_keys_dir: datadir.join(CLIENT_DIR),
            server_dir,
        }
    }

    pub fn host_key_path(&self) -> &Path {
        &self.host_key_path
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn authorized_keys_dir(&self) -> &Path {
        &self.authorized_keys_dir
    }

    /// Check if the server has published both its host key and socket
    pub async fn is_ready(&self) -> Result<bool, SshError> {
        for path in [&self.host_key_path, &self.socket_path] {
            if !tokio::fs::try_exists(path).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Block until the server is ready or `cancel` fires
    ///
    /// The `server` directory must already exist; it is watched for changes
    /// and readiness is rechecked after each one.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), SshError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })
        .map_err(|e| SshError::Rendezvous(e.to_string()))?;

        watcher
            .watch(&self.server_dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                SshError::Rendezvous(format!("{}: {}", self.server_dir.display(), e))
            })?;

        let mut announced = false;
        loop {
            if self.is_ready().await? {
                debug!(dir = %self.server_dir.display(), "Server side is ready");
                return Ok(());
            }

            if !announced {
                info!("Wait for the server side to start...");
                announced = true;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(SshError::Cancelled),
                event = rx.recv() => match event {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(SshError::Rendezvous(e.to_string())),
                    None => return Err(SshError::Rendezvous("watcher stopped".to_string())),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn datadir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("server")).unwrap();
        std::fs::create_dir(dir.path().join("client")).unwrap();
        dir
    }

    #[test]
    fn test_paths() {
        let r = Rendezvous::new("/run/devcontainer-portforward");
        assert_eq!(
            r.host_key_path(),
            Path::new("/run/devcontainer-portforward/server/rsa_hostkey.pub")
        );
        assert_eq!(
            r.socket_path(),
            Path::new("/run/devcontainer-portforward/server/ssh.sock")
        );
        assert_eq!(
            r.authorized_keys_dir(),
            Path::new("/run/devcontainer-portforward/client")
        );
    }

    #[tokio::test]
    async fn test_wait_returns_when_already_ready() {
        let dir = datadir();
        std::fs::write(dir.path().join("server/rsa_hostkey.pub"), "key").unwrap();
        std::fs::write(dir.path().join("server/ssh.sock"), "").unwrap();

        let r = Rendezvous::new(dir.path());
        tokio::time::timeout(Duration::from_secs(5), r.wait(&CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_after_files_appear() {
        let dir = datadir();
        let r = Rendezvous::new(dir.path());
        assert!(!r.is_ready().await.unwrap());

        let server = dir.path().join("server");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(server.join("rsa_hostkey.pub"), "key").unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(server.join("ssh.sock"), "").unwrap();
        });

        tokio::time::timeout(Duration::from_secs(5), r.wait(&CancellationToken::new()))
            .await
            .expect("rendezvous did not complete")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let dir = datadir();
        let r = Rendezvous::new(dir.path());
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), r.wait(&cancel))
            .await
            .unwrap();
        assert!(matches!(result, Err(SshError::Cancelled)));
    }

    #[tokio::test]
    async fn test_missing_server_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let r = Rendezvous::new(dir.path());
        let result = r.wait(&CancellationToken::new()).await;
        assert!(matches!(result, Err(SshError::Rendezvous(_))));
    }
}
