//! kubegate binary entry point.
//!
//! Parses CLI arguments, loads configuration, builds the cluster client, and
//! runs the proxy server until interrupted. Active bridges are not torn down
//! by the shutdown signal; the process exits once the listener has stopped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kubegate::{
    cli::Cli,
    cluster::ClusterClient,
    config::{Config, ConfigLoader},
    proxy::{ProxyConfig, ProxyServer, Router},
};
use tokio::sync::watch;
use tracing::{debug, error, info};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_loader = ConfigLoader::new();
    let config = config_loader
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(cli.verbose, &config.general.log_level)?;
    debug!("Loaded configuration: {:?}", config);

    let listen = config.listen_addr().context("Invalid listen address")?;

    // rustls needs a process-level crypto provider before any TLS config is
    // built; tolerate a provider installed earlier.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(run(config, listen))
}

/// Initialize the tracing subscriber on stderr.
///
/// # Verbosity Levels
/// - 0 (default): the configured log level (or `RUST_LOG` when set)
/// - 1 (-v): info level
/// - 2 (-vv): debug level
/// - 3+ (-vvv): trace level
fn init_tracing(verbose: u8, default_level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level.to_string())),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

/// Build the cluster client and run the proxy until Ctrl+C.
async fn run(config: Config, listen: std::net::SocketAddr) -> Result<()> {
    let cluster = ClusterClient::new(config.cluster.kubeconfig.as_deref())
        .await
        .context("Failed to create cluster client")?;
    info!(
        "Intercepting *.{} hosts (kubeconfig: {})",
        config.cluster.domain,
        config
            .cluster
            .kubeconfig
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "auto-discovered".to_string())
    );

    let router = Arc::new(Router::new(Arc::new(cluster), &config.cluster.domain));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::new(ProxyConfig { listen }, router, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("proxy server error: {e}");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt signal")?;
    info!("Interrupt received, shutting down");

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), server_handle).await;

    Ok(())
}
