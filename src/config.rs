//! Command line and config file handling

use anyhow::{Context, Result};
use clap::Parser;
use devfwd_agent::{AgentConfig, SessionConfig, DEFAULT_POLL_INTERVAL};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const DEFAULT_DATADIR: &str = "/run/devcontainer-portforward";
const DEFAULT_USER: &str = "user";

/// devfwd - forwards every port bound in this container to the host
#[derive(Parser, Debug)]
#[command(name = "devfwd")]
#[command(about = "Forwards every locally bound TCP port to the host over SSH")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
devfwd runs inside a development container. It waits for the host-side
server to publish its SSH socket in the shared data directory, connects,
and from then on mirrors every listening TCP port of the container onto
the host.

EXAMPLES:
  # Run with the default shared directory
  devfwd

  # Use another shared directory and skip the container's sshd
  devfwd --datadir /mnt/portforward --ignore-port 22

  # Start with a config file and verbose logging
  devfwd --config devfwd.yaml --log-level debug

ENVIRONMENT VARIABLES:
  DEVFWD_DATADIR           Shared data directory
  DEVFWD_USER              SSH user name
  DEVFWD_POLL_INTERVAL_MS  Listening socket poll interval in milliseconds
  DEVFWD_IGNORE_PORTS      Comma separated ports that are never forwarded
"#)]
pub struct Args {
    /// Directory where the volume shared with the server is mounted
    #[arg(long, env = "DEVFWD_DATADIR")]
    pub datadir: Option<PathBuf>,

    /// User name to authenticate as
    #[arg(long, env = "DEVFWD_USER")]
    pub user: Option<String>,

    /// Interval between two listening socket scans, in milliseconds
    #[arg(long, env = "DEVFWD_POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// Port that is never forwarded (repeatable)
    #[arg(long = "ignore-port", env = "DEVFWD_IGNORE_PORTS", value_delimiter = ',')]
    pub ignore_ports: Vec<u16>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Where to find the server
    #[serde(default)]
    pub server: ServerConfigFile,

    /// Forwarding behaviour
    #[serde(default)]
    pub agent: AgentConfigFile,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datadir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignored_ports: Vec<u16>,

    /// Host local services are dialed on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_host: Option<IpAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}

/// Everything the bootstrap needs
#[derive(Debug, Clone)]
pub struct Config {
    pub datadir: PathBuf,
    pub user: String,
    pub agent: AgentConfig,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with config file, giving precedence to CLI args
pub fn build_config(args: Args) -> Result<Config> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    merge(args, file)
}

fn merge(args: Args, file: ConfigFile) -> Result<Config> {
    let datadir = args
        .datadir
        .or(file.server.datadir)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATADIR));
    let user = args
        .user
        .or(file.server.user)
        .unwrap_or_else(|| DEFAULT_USER.to_string());

    let poll_interval = args
        .poll_interval_ms
        .or(file.agent.poll_interval_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_POLL_INTERVAL);

    let ignored_ports = if args.ignore_ports.is_empty() {
        file.agent.ignored_ports
    } else {
        args.ignore_ports
    };

    let defaults = SessionConfig::default();
    let session = SessionConfig {
        local_host: file.agent.local_host.unwrap_or(defaults.local_host),
        connect_timeout: file
            .agent
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.connect_timeout),
    };

    // Validate configuration
    if datadir.as_os_str().is_empty() {
        anyhow::bail!("Data directory cannot be empty (use --datadir or config file)");
    }
    if user.is_empty() {
        anyhow::bail!("User cannot be empty (use --user or config file)");
    }
    if poll_interval.is_zero() {
        anyhow::bail!("Poll interval must be greater than zero");
    }
    if session.connect_timeout.is_zero() {
        anyhow::bail!("Connect timeout must be greater than zero");
    }

    Ok(Config {
        datadir,
        user,
        agent: AgentConfig {
            poll_interval,
            session,
            ignored_ports: ignored_ports.into_iter().collect(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["devfwd"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = merge(args(&[]), ConfigFile::default()).unwrap();

        assert_eq!(config.datadir, PathBuf::from("/run/devcontainer-portforward"));
        assert_eq!(config.user, "user");
        assert_eq!(config.agent.poll_interval, Duration::from_secs(1));
        assert_eq!(config.agent.session.local_host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.agent.session.connect_timeout, Duration::from_secs(10));
        assert!(config.agent.ignored_ports.is_empty());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: ConfigFile = serde_yaml::from_str(
            r#"
server:
  datadir: /from/file
  user: fileuser
agent:
  poll_interval_ms: 250
  ignored_ports: [22]
  local_host: "::1"
  connect_timeout_ms: 500
"#,
        )
        .unwrap();

        let config = merge(
            args(&["--datadir", "/from/cli", "--ignore-port", "80", "--ignore-port", "443"]),
            file,
        )
        .unwrap();

        assert_eq!(config.datadir, PathBuf::from("/from/cli"));
        assert_eq!(config.user, "fileuser");
        assert_eq!(config.agent.poll_interval, Duration::from_millis(250));
        assert_eq!(
            config.agent.ignored_ports.into_iter().collect::<Vec<_>>(),
            vec![80, 443]
        );
        assert_eq!(config.agent.session.local_host, "::1".parse::<IpAddr>().unwrap());
        assert_eq!(config.agent.session.connect_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_file_ignored_ports_used_without_cli() {
        let file = ConfigFile {
            agent: AgentConfigFile {
                ignored_ports: vec![22, 2222],
                ..Default::default()
            },
            ..Default::default()
        };
        let config = merge(args(&[]), file).unwrap();
        assert!(config.agent.ignored_ports.contains(&2222));
    }

    #[test]
    fn test_comma_separated_ignore_ports() {
        let parsed = args(&["--ignore-port", "22,8022"]);
        assert_eq!(parsed.ignore_ports, vec![22, 8022]);
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        assert!(merge(args(&["--poll-interval-ms", "0"]), ConfigFile::default()).is_err());
    }

    #[test]
    fn test_empty_datadir_rejected() {
        let file = ConfigFile {
            server: ServerConfigFile {
                datadir: Some(PathBuf::new()),
                user: None,
            },
            ..Default::default()
        };
        assert!(merge(args(&[]), file).is_err());
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  user: vscode").unwrap();

        let loaded = load_config_file(file.path()).unwrap();
        assert_eq!(loaded.server.user.as_deref(), Some("vscode"));
        assert!(loaded.agent.poll_interval_ms.is_none());
    }

    #[test]
    fn test_invalid_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "agent: [not, a, map]").unwrap();
        assert!(load_config_file(file.path()).is_err());
    }
}
