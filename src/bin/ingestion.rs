//! Ingestion pipeline entry point.

use anyhow::Result;
use nexus_edge::config::IngestConfig;
use nexus_edge::health::{self, HealthRegistry, HealthStatus, StatusFn};
use nexus_edge::ingest::pipeline::Pipeline;
use nexus_edge::metrics;
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
                .unwrap_or_else(|_| "nexus_edge=info,nexus_ingestion=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting ingestion pipeline v{}", env!("CARGO_PKG_VERSION"));

    let config = IngestConfig::load()?;
    info!(
        environment = %config.environment,
        share_group = %config.share_group,
        "configuration loaded"
    );

    let cancel = CancellationToken::new();
    let pipeline = Pipeline::start(config.clone(), cancel.clone())
        .await
        .map_err(|e| anyhow::anyhow!("pipeline startup failed: {}", e))?;

    let registry = HealthRegistry::new();
    let status_pipeline = pipeline.clone();
    let status: StatusFn = Arc::new(move || {
        let pipeline = status_pipeline.clone();
        Box::pin(async move { pipeline.status() })
    });
    let http_cancel = cancel.clone();
    let http_port = config.http_port;
    let http_registry = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(http_port, http_registry, status, http_cancel).await {
            error!(error = %e, "http surface failed");
        }
    });

    let probe_pipeline = pipeline.clone();
    let probe_registry = registry.clone();
    let probe_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = probe_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let store = if probe_pipeline.is_store_connected() {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Unhealthy
                    };
                    probe_registry.set("store", store, None);
                    let broker = if metrics::INGEST_MQTT_CONNECTED.get() == 1 {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Unhealthy
                    };
                    probe_registry.set("broker", broker, None);
                }
            }
        }
    });

    info!("ingestion ready; waiting for shutdown signal");
    wait_for_shutdown().await;

    info!("shutdown signal received");
    pipeline.shutdown().await;
    info!("ingestion pipeline stopped");
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
