//! Ephemeral client identity and the fixed server host key

use crate::error::SshError;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{Algorithm, HashAlg, PrivateKey, PublicKey};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Attempts at finding an unused file name for the authorized key
pub const KEY_DROP_ATTEMPTS: usize = 100;

/// Keypair generated for a single agent run
#[derive(Clone)]
pub struct ClientKey {
    key: Arc<PrivateKey>,
}

impl ClientKey {
    /// Generate a fresh Ed25519 keypair
    pub fn generate() -> Result<Self, SshError> {
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .map_err(|e| SshError::Key(e.to_string()))?;
        Ok(Self { key: Arc::new(key) })
    }

    pub fn public_key(&self) -> &PublicKey {
        self.key.public_key()
    }

    /// The public key as an `authorized_keys` line, newline terminated
    pub fn authorized_line(&self) -> Result<String, SshError> {
        let mut line = self
            .public_key()
            .to_openssh()
            .map_err(|e| SshError::Key(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    pub(crate) fn auth_material(&self) -> PrivateKeyWithHashAlg {
        PrivateKeyWithHashAlg::new(self.key.clone(), None)
    }
}

impl std::fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientKey")
            .field("fingerprint", &fingerprint(self.public_key()))
            .finish()
    }
}

/// The only host key the server is allowed to present
#[derive(Debug, Clone)]
pub struct HostKey {
    key: PublicKey,
}

impl HostKey {
    /// Read an OpenSSH public key line from `path`
    pub async fn load(path: &Path) -> Result<Self, SshError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SshError::HostKey {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        Self::parse(&raw).map_err(|reason| SshError::HostKey {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn parse(raw: &str) -> Result<Self, String> {
        let line = raw
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .ok_or_else(|| "no key found".to_string())?;

        let key = PublicKey::from_openssh(line).map_err(|e| e.to_string())?;
        Ok(Self { key })
    }

    /// Check that `presented` carries the same key material
    pub fn verify(&self, presented: &PublicKey) -> bool {
        self.key.key_data() == presented.key_data()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.key)
    }
}

impl From<PublicKey> for HostKey {
    fn from(key: PublicKey) -> Self {
        Self { key }
    }
}

pub(crate) fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// An authorized key file dropped for the server to pick up
///
/// The file is removed when this guard is dropped.
#[derive(Debug)]
pub struct AuthorizedKeyDrop {
    path: PathBuf,
}

impl AuthorizedKeyDrop {
    /// Write `line` to a new `<8 hex digits>.pub` file in `dir`
    pub fn store(dir: &Path, line: &str) -> Result<Self, SshError> {
        Self::store_with(dir, line, rand::random::<u32>)
    }

    pub(crate) fn store_with(
        dir: &Path,
        line: &str,
        mut next_name: impl FnMut() -> u32,
    ) -> Result<Self, SshError> {
        for _ in 0..KEY_DROP_ATTEMPTS {
            let path = dir.join(format!("{:08x}.pub", next_name()));

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };

            // Owns the file from here on, so a failed write still cleans up
            let dropped = Self { path };
            file.write_all(line.as_bytes())?;
            file.sync_all()?;

            debug!(path = %dropped.path.display(), "Stored authorized key");
            return Ok(dropped);
        }

        Err(SshError::KeyDropExhausted {
            dir: dir.to_path_buf(),
            attempts: KEY_DROP_ATTEMPTS,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AuthorizedKeyDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "Failed to remove authorized key: {}", e);
        }
    }
}
