use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use toolgate::config::{Config, ConfigSource};
use toolgate::gateway::Gateway;
use toolgate::process::BackendManager;
use toolgate::server::{GatewayServer, PKG_NAME, VERSION};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("toolgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let mut config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    config.apply_port_override(std::env::var("PORT").ok().as_deref())?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = BackendManager::with_default_environment(config.server.call_timeout());
    let gateway = Gateway::new(manager, ConfigSource::File(config_path.clone()));
    gateway.start_all(&config);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = GatewayServer::new(bind_addr, Arc::clone(&gateway), shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP reconciles backends with the config
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    match gateway.load_config() {
                        Ok(config) => {
                            let result = gateway.reconcile(&config).await;
                            info!(
                                started = ?result.started,
                                stopped = ?result.stopped,
                                changed = ?result.changed,
                                "Backends reconciled with configuration"
                            );
                        }
                        Err(e) => error!(error = %e, "Failed to reload configuration"),
                    }
                }
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

    info!("Stopping all backends...");
    if tokio::time::timeout(Duration::from_secs(10), gateway.shutdown())
        .await
        .is_err()
    {
        warn!("Timed out stopping backends");
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting tool gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        call_timeout_ms = config.server.call_timeout_ms,
        "Server configuration"
    );
    info!(
        backend_count = config.mcp.servers.len(),
        backends = ?config.backend_names(),
        "Configured backends"
    );
}
