//! Enumerating listening TCP sockets from `/proc/net`
//!
//! The kernel exposes one row per socket in `/proc/net/tcp` and
//! `/proc/net/tcp6`:
//!
//! ```text
//!   sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
//!    0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345
//! ```
//!
//! Addresses are printed as host-order 32-bit words (one for IPv4, four for
//! IPv6). Ports are printed in plain big-endian hex.

use crate::endpoint::{Endpoint, ListenSnapshot};
use crate::error::QueryError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

const DEFAULT_PROC_NET: &str = "/proc/net";
const TCP_LISTEN: &str = "0A";

/// Point-in-time listing of locally bound listening endpoints
#[async_trait]
pub trait ListenQuery: Send {
    /// Return every endpoint currently in the listening state
    async fn list_bound_endpoints(&mut self) -> Result<ListenSnapshot, QueryError>;
}

/// `ListenQuery` backed by the kernel's socket tables
#[derive(Debug, Clone)]
pub struct ProcNetQuery {
    root: PathBuf,
}

impl ProcNetQuery {
    pub fn new() -> Self {
        Self::with_root(DEFAULT_PROC_NET)
    }

    /// Read `tcp` and `tcp6` from `root` instead of `/proc/net`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_table(path: &Path) -> Result<Option<String>, QueryError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(QueryError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl Default for ProcNetQuery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ListenQuery for ProcNetQuery {
    async fn list_bound_endpoints(&mut self) -> Result<ListenSnapshot, QueryError> {
        let tcp_path = self.root.join("tcp");
        let tcp = Self::read_table(&tcp_path)
            .await?
            .ok_or_else(|| QueryError::Read {
                path: tcp_path.clone(),
                source: std::io::Error::from(ErrorKind::NotFound),
            })?;

        let mut snapshot = ListenSnapshot::new();
        parse_table(&tcp, false, &mut snapshot)?;

        // Absent when IPv6 is disabled
        if let Some(tcp6) = Self::read_table(&self.root.join("tcp6")).await? {
            parse_table(&tcp6, true, &mut snapshot)?;
        }

        Ok(snapshot)
    }
}

/// Collect listening rows of one socket table into `out`
pub fn parse_table(
    content: &str,
    is_ipv6: bool,
    out: &mut ListenSnapshot,
) -> Result<(), QueryError> {
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 4 {
            return Err(QueryError::Parse(format!("Truncated row: {}", line.trim())));
        }

        if !fields[3].eq_ignore_ascii_case(TCP_LISTEN) {
            continue;
        }

        out.insert(parse_local_address(fields[1], is_ipv6)?);
    }

    Ok(())
}

fn parse_local_address(s: &str, is_ipv6: bool) -> Result<Endpoint, QueryError> {
    let (addr_hex, port_hex) = s
        .split_once(':')
        .ok_or_else(|| QueryError::Parse(format!("Invalid local address: {}", s)))?;

    let port = u16::from_str_radix(port_hex, 16)
        .map_err(|_| QueryError::Parse(format!("Invalid port: {}", port_hex)))?;

    if is_ipv6 {
        if addr_hex.len() != 32 {
            return Err(QueryError::Parse(format!(
                "Invalid IPv6 address length: {}",
                addr_hex
            )));
        }
        let mut octets = [0u8; 16];
        for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
            let word = parse_word(&addr_hex[i * 8..(i + 1) * 8])?;
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        Ok(Endpoint::new(Ipv6Addr::from(octets), port))
    } else {
        if addr_hex.len() != 8 {
            return Err(QueryError::Parse(format!(
                "Invalid IPv4 address length: {}",
                addr_hex
            )));
        }
        let word = parse_word(addr_hex)?;
        Ok(Endpoint::new(Ipv4Addr::from(word.to_ne_bytes()), port))
    }
}

fn parse_word(hex: &str) -> Result<u32, QueryError> {
    u32::from_str_radix(hex, 16).map_err(|_| QueryError::Parse(format!("Invalid address: {}", hex)))
}
