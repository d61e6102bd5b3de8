//! Subgate binary: loads the configuration, wires the orchestrator to Docker
//! and the registry, and serves until a shutdown signal arrives

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use subgate::api::{ControlApi, PKG_NAME, VERSION};
use subgate::config::Config;
use subgate::dispatcher::HostDispatcher;
use subgate::engine::DockerEngine;
use subgate::orchestrator::{LaunchSettings, Orchestrator};
use subgate::registry::SqliteRegistry;
use subgate::routes::ReverseProxy;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("subgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let registry_path = config.storage.registry_path();
    let registry = Arc::new(SqliteRegistry::open(&registry_path)?);
    info!(path = %registry_path.display(), "Registry opened");

    let engine = Arc::new(DockerEngine::connect(config.docker.endpoint.as_deref()).await?);
    let proxy = Arc::new(ReverseProxy::new());

    let settings = LaunchSettings {
        parameters: config.parameters.clone(),
        host_config: config.docker.host_config.clone(),
        stop_grace: config.docker.stop_grace(),
    };
    let orchestrator = Arc::new(Orchestrator::new(engine, registry, proxy.clone(), settings));

    match orchestrator.restore_routes().await {
        Ok(count) => info!(count, "Routes restored from registry"),
        Err(e) => warn!(error = %e, "Failed to restore routes; starting with an empty route table"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api = Arc::new(ControlApi::new(
        Arc::clone(&orchestrator),
        config.docker.default_image.clone(),
    ));
    let dispatcher = Arc::new(HostDispatcher::new(config.host.clone(), api, proxy));

    let listen = config.listen.clone();
    let mut dispatcher_handle = tokio::spawn(async move { dispatcher.run(&listen, shutdown_rx).await });

    // Wait for a shutdown signal, or for every listener to have stopped on its own
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
            result = &mut dispatcher_handle => {
                return listeners_exited(result);
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down...");
            }
            result = &mut dispatcher_handle => {
                return listeners_exited(result);
            }
        }
    }

    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(5), dispatcher_handle).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "Listeners stopped with an error"),
        Ok(Err(e)) => warn!(error = %e, "Listener task failed"),
        Ok(Ok(Ok(()))) => {}
        Err(_) => warn!("Listeners did not stop within 5s"),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Listeners only stop by themselves when none of them could keep serving
fn listeners_exited(
    result: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    let err = match result {
        Ok(Ok(())) => anyhow::anyhow!("listeners stopped unexpectedly"),
        Ok(Err(e)) => e,
        Err(e) => anyhow::anyhow!("listener task failed: {}", e),
    };
    error!(error = %err, "Shutting down");
    Err(err)
}

fn print_startup_banner(config: &Config) {
    info!("========================================");
    info!("  {} v{}", PKG_NAME, VERSION);
    info!("========================================");
    info!("  Control API host: {}", config.host.webapi);
    info!("  Subdomain suffix: {}", config.host.reverse_proxy_suffix);
    for port in &config.listen.http {
        info!(
            "  Listening: {}:{} -> container port {}",
            config.listen.foreign_address, port.listen_port, port.target_port
        );
    }
    info!("  Registry:         {}", config.storage.registry_path().display());
    if let Some(ref image) = config.docker.default_image {
        info!("  Default image:    {}", image);
    }
    info!("========================================");
}
