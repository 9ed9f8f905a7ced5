//! Ingestion orchestrator: wires subscriber → queue → batcher → writers
//! and owns the drain-ordered shutdown.

use super::batcher::{Batch, BatchPool, Batcher};
use super::subscriber::IngestSubscriber;
use super::writer::TelemetryWriter;
use crate::config::IngestConfig;
use crate::error::IngestResult;
use crate::metrics;
use crate::retry::RetryPolicy;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Pipeline {
    config: IngestConfig,
    db: PgPool,
    cancel: CancellationToken,
    batcher_task: Mutex<Option<JoinHandle<()>>>,
    writer_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Connect to the store and bring the stages up back-to-front, so
    /// every stage's consumer exists before its producer starts.
    pub async fn start(
        config: IngestConfig,
        cancel: CancellationToken,
    ) -> IngestResult<Arc<Self>> {
        let db = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database.url())
            .await?;
        info!(
            host = %config.database.host,
            database = %config.database.name,
            "connected to time-series store"
        );

        let batch_pool = BatchPool::new(config.batch_size, config.writer_count * 2 + 2);
        let (point_tx, point_rx) = mpsc::channel(config.queue_capacity);
        let (batch_tx, batch_rx) = mpsc::channel::<Batch>(config.writer_count * 2);

        // Writers first.
        let shared_rx = Arc::new(Mutex::new(batch_rx));
        let retry = RetryPolicy {
            max_attempts: config.max_retries,
            initial_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let writer = TelemetryWriter::new(db.clone(), retry, batch_pool.clone());
        let mut writer_tasks = Vec::with_capacity(config.writer_count);
        for _ in 0..config.writer_count {
            writer_tasks.push(tokio::spawn(writer.clone().run(shared_rx.clone())));
        }

        // Then the batcher.
        let batcher = Batcher::new(config.batch_size, config.flush_interval(), batch_pool);
        let batcher_task = tokio::spawn(batcher.run(point_rx, batch_tx));

        // Finally the subscriber, the only holder of the point sender.
        IngestSubscriber::start(&config, point_tx, cancel.clone())?;

        info!(
            queue_capacity = config.queue_capacity,
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval_ms,
            writers = config.writer_count,
            "ingestion pipeline started"
        );

        Ok(Arc::new(Pipeline {
            config,
            db,
            cancel,
            batcher_task: Mutex::new(Some(batcher_task)),
            writer_tasks: Mutex::new(writer_tasks),
        }))
    }

    /// Drain-ordered shutdown: stop the subscriber (closing the point
    /// channel), let the batcher flush what is pending, wait for the
    /// writers to finish their batches, then close the store pool.
    pub async fn shutdown(&self) {
        let budget = self.config.shutdown_timeout();
        info!(budget_secs = budget.as_secs(), "ingestion pipeline shutting down");
        self.cancel.cancel();

        let drain = async {
            if let Some(task) = self.batcher_task.lock().await.take() {
                let _ = task.await;
            }
            for task in self.writer_tasks.lock().await.drain(..) {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(budget, drain).await.is_err() {
            warn!("shutdown budget exhausted before pipeline drained");
        }

        self.db.close().await;
        info!(
            received = metrics::INGEST_RECEIVED.get(),
            written = metrics::INGEST_WRITTEN.get(),
            dropped = metrics::INGEST_DROPPED.get(),
            "ingestion pipeline stopped"
        );
    }

    pub fn is_store_connected(&self) -> bool {
        !self.db.is_closed()
    }

    /// Counter snapshot for the `/status` endpoint.
    pub fn status(&self) -> serde_json::Value {
        json!({
            "environment": self.config.environment,
            "share_group": self.config.share_group,
            "points_received": metrics::INGEST_RECEIVED.get(),
            "points_written": metrics::INGEST_WRITTEN.get(),
            "points_dropped": metrics::INGEST_DROPPED.get(),
            "parse_errors": metrics::INGEST_PARSE_ERRORS.get(),
            "write_errors": metrics::INGEST_WRITE_ERRORS.get(),
            "queue_depth": metrics::QUEUE_DEPTH.get(),
        })
    }
}
