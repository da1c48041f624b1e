//! Tether sidecar binary.
//!
//! Serves the sidecar API, joins the bus and optionally launches the
//! application given after the flags.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tether_sidecar::config::SidecarConfig;
use tether_sidecar::{launcher, Sidecar};
use tether_state::StateProvider;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Tether sidecar.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Connect an application to the service and actor bus")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Service name the application joins.
    #[arg(short, long)]
    service: Option<String>,

    /// Actor type hosted by the application (repeatable).
    #[arg(short, long = "actor", value_name = "TYPE")]
    actors: Vec<String>,

    /// Port the application listens on.
    #[arg(long)]
    app_port: Option<u16>,

    /// Port the sidecar listens on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Sidecar id.
    #[arg(long)]
    id: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Application command line.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl Cli {
    fn apply(&self, config: &mut SidecarConfig) {
        if let Some(service) = &self.service {
            config.sidecar.service = Some(service.clone());
        }
        if !self.actors.is_empty() {
            config.sidecar.actors = self.actors.clone();
        }
        if let Some(port) = self.app_port {
            config.app.port = port;
        }
        if let Some(port) = self.port {
            config.server.bind_address = SocketAddr::new(config.server.bind_address.ip(), port);
        }
        if let Some(id) = &self.id {
            config.sidecar.id = Some(id.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug,hyper=info,tower=info"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    info!("Tether sidecar starting");

    let mut config = match (SidecarConfig::load(cli.config.as_deref()), &cli.config) {
        (Ok(config), _) => config,
        (Err(e), Some(path)) => {
            error!(path = %path.display(), error = %e, "Failed to load config");
            return Err(e.into());
        }
        (Err(e), None) => {
            info!(error = %e, "Failed to load config, using defaults");
            SidecarConfig::default()
        }
    };
    cli.apply(&mut config);

    info!(
        bind_address = %config.server.bind_address,
        app = %config.app.base_url(),
        service = ?config.sidecar.service,
        actors = ?config.sidecar.actors,
        workers = config.dispatch.workers,
        "Configuration loaded"
    );

    let cancel = CancellationToken::new();

    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, initiating graceful shutdown");
        cancel_on_signal.cancel();
    });

    let listener = TcpListener::bind(config.server.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_address))?;

    let provider = StateProvider::from_config(&config.state())
        .await
        .context("failed to connect state backends")?;

    let sidecar = Sidecar::from_config(&config, &provider, listener, cancel.clone()).await?;

    let child = if cli.command.is_empty() {
        None
    } else {
        let env = launcher::child_env(sidecar.port(), config.app.port, sidecar.state().id());
        let command = cli.command.clone();
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = launcher::run(&command, &env, cancel.clone()).await {
                error!(error = %e, "Failed to run application");
            }
            cancel.cancel();
        }))
    };

    if let Err(e) = sidecar.wait().await {
        error!(error = %e, "Sidecar error");
        return Err(e.into());
    }

    if let Some(child) = child {
        if let Err(e) = child.await {
            error!(error = %e, "Launcher task failed");
        }
    }

    info!("Tether sidecar shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C");
        }
        () = terminate => {
            info!("Received SIGTERM");
        }
    }
}
