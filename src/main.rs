//! devfwd - dynamic port forwarding agent
//!
//! Waits for the host-side server, connects to it over SSH and forwards every
//! TCP port that starts listening inside the container.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{build_config, Args, Config};
use devfwd_agent::{Agent, ProcNetQuery};
use devfwd_transport::Transport;
use devfwd_transport_ssh::{
    AuthorizedKeyDrop, ClientKey, HostKey, Rendezvous, SshConfig, SshError, SshTransport,
};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Cancel `cancel` on SIGINT, SIGTERM or SIGHUP
fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = hangup.recv() => "SIGHUP",
        };
        info!("Received {}, shutting down...", name);
        cancel.cancel();
    });

    Ok(())
}

async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let rendezvous = Rendezvous::new(&config.datadir);
    match rendezvous.wait(&cancel).await {
        Ok(()) => {}
        Err(SshError::Cancelled) => {
            info!("Cancelled before the server side was ready");
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed waiting for the server side"),
    }

    let client_key = ClientKey::generate().context("Failed to generate client key")?;
    let host_key = HostKey::load(rendezvous.host_key_path())
        .await
        .context("Failed to load server host key")?;

    // Removed again when this guard drops at the end of the run
    let key_drop = AuthorizedKeyDrop::store(
        rendezvous.authorized_keys_dir(),
        &client_key.authorized_line()?,
    )
    .context("Failed to store authorized key")?;
    info!(path = %key_drop.path().display(), "Authorized key stored");

    let transport = SshTransport::connect(SshConfig {
        socket_path: rendezvous.socket_path().to_path_buf(),
        user: config.user.clone(),
        host_key,
        client_key,
    })
    .await
    .context("Failed to connect to the server")?;
    let transport = Arc::new(transport);

    info!("Forward is ready");

    let agent_cancel = cancel.child_token();
    let watchdog = {
        let transport = transport.clone();
        let agent_cancel = agent_cancel.clone();
        tokio::spawn(async move {
            transport.closed().await;
            agent_cancel.cancel();
        })
    };

    let agent = Agent::new(transport.clone(), ProcNetQuery::new(), config.agent);
    let result = agent.run(agent_cancel).await;

    watchdog.abort();
    let lost = transport.is_closed() && !cancel.is_cancelled();
    if lost {
        warn!("SSH connection closed by the server");
    }
    transport.disconnect().await;
    drop(key_drop);

    result.context("Listen watcher failed")?;
    if lost {
        anyhow::bail!("SSH connection lost");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Setup logging first
    setup_logging(&args.log_level)?;

    info!("Starting devfwd agent {}", env!("GIT_TAG"));

    let config = build_config(args).context("Failed to build configuration")?;
    info!("Data directory: {}", config.datadir.display());
    info!("User: {}", config.user);
    if !config.agent.ignored_ports.is_empty() {
        info!("Ignored ports: {:?}", config.agent.ignored_ports);
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    match run(config, cancel).await {
        Ok(()) => {
            info!("Agent stopped");
            Ok(())
        }
        Err(e) => {
            error!("Agent error: {:#}", e);
            Err(e)
        }
    }
}
