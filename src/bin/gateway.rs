//! Protocol gateway entry point.

use anyhow::Result;
use nexus_edge::config::GatewayConfig;
use nexus_edge::gateway::Gateway;
use nexus_edge::health::{self, HealthRegistry, HealthStatus, StatusFn};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nexus_edge=info,nexus_gateway=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting protocol gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::load()?;
    info!(environment = %config.environment, "configuration loaded");

    let devices = config.load_devices()?;
    if devices.is_empty() {
        info!("device inventory is empty; waiting for config events");
    } else {
        info!(devices = devices.len(), "device inventory loaded");
    }

    let cancel = CancellationToken::new();
    let gateway = Gateway::start(config.clone(), devices, cancel.clone()).await?;

    // HTTP surface: health, readiness, status, metrics.
    let registry = HealthRegistry::new();
    let status_gateway = gateway.clone();
    let status: StatusFn = Arc::new(move || {
        let gateway = status_gateway.clone();
        Box::pin(async move { gateway.status().await })
    });
    let http_cancel = cancel.clone();
    let http_port = config.http_port;
    let http_registry = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(http_port, http_registry, status, http_cancel).await {
            error!(error = %e, "http surface failed");
        }
    });

    // Keep component health current for the readiness probe.
    let probe_gateway = gateway.clone();
    let probe_registry = registry.clone();
    let probe_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = probe_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let broker = if probe_gateway.is_broker_connected() {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Unhealthy
                    };
                    probe_registry.set("broker", broker, None);
                    probe_registry.set(
                        "devices",
                        HealthStatus::Healthy,
                        Some(format!("{} registered", probe_gateway.device_count().await)),
                    );
                }
            }
        }
    });

    info!("gateway ready; waiting for shutdown signal");
    wait_for_shutdown().await;

    info!("shutdown signal received");
    gateway.shutdown().await;
    info!("protocol gateway stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => { sigterm.recv().await; }
                    Err(_) => std::future::pending::<()>().await,
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {}
    }
}
