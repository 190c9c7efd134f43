use spawnrelay::config::Config;
use spawnrelay::proxy::{ProxyServer, Relay};
use spawnrelay::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Config file read when no path is given
const DEFAULT_CONFIG: &str = "relay.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("spawnrelay=info".parse().expect("valid log directive")),
        )
        .init();

    let mut config = load_config().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    // PORT from the environment wins over the config file
    if let Some(port) = std::env::var("PORT").ok().filter(|p| !p.is_empty()) {
        config.server.port = port
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid PORT {:?}: {}", port, e))?;
    }

    print_startup_banner(&config);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {}", e))?;

    let relay = Relay::new(&config).await.map_err(|e| {
        error!(error = %e, "Failed to start backend");
        anyhow::Error::from(e)
    })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::new(bind_addr, relay.clone(), shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Relay server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping backend...");
    relay.shutdown().await;

    // Wait for the server to stop (with timeout)
    if tokio::time::timeout(Duration::from_secs(5), server_handle)
        .await
        .is_err()
    {
        warn!("Relay server did not stop in time");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Load the config named on the command line, else `relay.toml` if present,
/// else defaults.
fn load_config() -> anyhow::Result<Config> {
    if let Some(path) = std::env::args().nth(1).map(PathBuf::from) {
        let config = Config::load(&path)?;
        info!(path = %path.display(), "Configuration loaded");
        return Ok(config);
    }

    let path = PathBuf::from(DEFAULT_CONFIG);
    if path.exists() {
        let config = Config::load(&path)?;
        info!(path = %path.display(), "Configuration loaded");
        return Ok(config);
    }

    info!("No configuration file, using defaults");
    let config = Config::default();
    config.validate()?;
    Ok(config)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting relay");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        command = %config.relay.command,
        bin_dir = %config.relay.bin_dir,
        listen_timeout_secs = config.relay.listen_timeout,
        shutdown_timeout_secs = config.relay.shutdown_timeout,
        "Backend settings"
    );
    info!(
        attempts = config.relay.attempts(),
        timeout_secs = config.relay.timeout,
        backoff_min_ms = config.relay.backoff.min,
        backoff_max_ms = config.relay.backoff.max,
        backoff_factor = config.relay.backoff.factor,
        jitter = config.relay.backoff.jitter,
        "Retry settings"
    );
}
