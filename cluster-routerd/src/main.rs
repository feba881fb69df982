mod api;
mod config;
mod dispatcher;
mod error;
mod monitor;
mod registry;
mod selector;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use mdns_sd::ServiceDaemon;
use tokio_util::sync::CancellationToken;
use crate::config::{Config, RegistryConfig};
use crate::dispatcher::ClusterDispatcher;
use crate::monitor::ReachabilityMonitor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cluster_routerd=info"))
        )
        .init();

    tracing::info!("Starting cluster-routerd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/cluster-router/routerd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // mDNS daemon only for the DNS-SD registry
    let mdns_daemon = match &config.registry {
        RegistryConfig::Mdns(mdns_config) => Some(create_daemon(mdns_config.interface.as_deref())?),
        RegistryConfig::Nacos(_) => None,
    };

    let registry = registry::build(&config.registry, mdns_daemon.as_ref())?;
    let selector = selector::from_kind(config.dispatch.selector);
    let dispatcher = ClusterDispatcher::new(registry.registry.clone(), selector, &config.dispatch)?;

    let (monitor, scheduler_handle) = ReachabilityMonitor::start(
        monitor::prober::from_config(&config.monitor),
        Duration::from_secs(config.monitor.interval_secs),
        config.monitor.max_concurrent_probes,
    );

    for target in &config.monitor.targets {
        match monitor.watch(&target.name, &target.address).await {
            Ok(online) => tracing::info!("Watching {} ({}), online: {}", target.name, target.address, online),
            Err(e) => tracing::warn!("Failed to watch {}: {}", target.name, e),
        }
    }

    let cancel = CancellationToken::new();

    let app_state = api::routes::AppState {
        dispatcher: Arc::new(dispatcher),
        monitor: monitor.clone(),
    };
    let app = api::routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    monitor.stop().await;

    let _ = tokio::join!(server_handle, scheduler_handle);

    if let Some(browser) = &registry.browser {
        if let Err(e) = browser.shutdown().await {
            tracing::error!("Failed to shutdown DNS-SD browser: {}", e);
        }
    }

    if let Some(daemon) = &mdns_daemon {
        if let Err(e) = daemon.shutdown() {
            tracing::error!("Failed to shutdown mDNS daemon: {}", e);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Daemon on every interface, or only `interface` when given
fn create_daemon(interface: Option<&str>) -> Result<ServiceDaemon> {
    let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;
    if let Some(interface) = interface {
        daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        daemon
            .enable_interface(interface)
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }
    Ok(daemon)
}
