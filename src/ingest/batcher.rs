//! Batch accumulation between the backpressure queue and the writers.
//!
//! One accumulator task drains the point channel into the current batch
//! and flushes on whichever fires first: size reaching the batch limit,
//! age reaching the flush interval, or channel closure at shutdown. A
//! flushed batch is immutable; writers hand its backing vector back to
//! the pool after a successful write to cap the allocation rate.

use crate::metrics;
use crate::model::DataPoint;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// A coalesced run of datapoints on its way to the store. Immutable once
/// flushed.
#[derive(Debug)]
pub struct Batch {
    points: Vec<DataPoint>,
    created_at: Instant,
}

impl Batch {
    pub fn points(&self) -> &[DataPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Surrender the backing vector for pooling.
    pub fn into_points(self) -> Vec<DataPoint> {
        self.points
    }
}

/// Free list of batch vectors, keyed by a single capacity class.
pub struct BatchPool {
    capacity: usize,
    free: Mutex<Vec<Vec<DataPoint>>>,
    max_pooled: usize,
}

impl BatchPool {
    pub fn new(capacity: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(BatchPool {
            capacity,
            free: Mutex::new(Vec::new()),
            max_pooled,
        })
    }

    pub fn take(&self) -> Vec<DataPoint> {
        self.free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.capacity))
    }

    /// Return a vector after a successful write. Entries are fully
    /// cleared before reuse.
    pub fn put(&self, mut points: Vec<DataPoint>) {
        points.clear();
        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_pooled {
            free.push(points);
        }
    }

    pub fn pooled(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

pub struct Batcher {
    batch_size: usize,
    flush_interval: std::time::Duration,
    pool: Arc<BatchPool>,
}

impl Batcher {
    pub fn new(
        batch_size: usize,
        flush_interval: std::time::Duration,
        pool: Arc<BatchPool>,
    ) -> Self {
        Batcher {
            batch_size,
            flush_interval,
            pool,
        }
    }

    /// Accumulate until the input channel closes, then flush the rest.
    pub async fn run(
        self,
        mut points: mpsc::Receiver<DataPoint>,
        batches: mpsc::Sender<Batch>,
    ) {
        let mut current = self.pool.take();
        let mut started: Option<Instant> = None;

        loop {
            tokio::select! {
                received = points.recv() => match received {
                    Some(point) => {
                        if current.is_empty() {
                            started = Some(Instant::now());
                        }
                        current.push(point);
                        if current.len() >= self.batch_size {
                            self.flush(&mut current, &mut started, &batches, "size").await;
                        }
                    }
                    None => {
                        self.flush(&mut current, &mut started, &batches, "shutdown").await;
                        break;
                    }
                },
                _ = age_elapsed(started, self.flush_interval), if started.is_some() => {
                    self.flush(&mut current, &mut started, &batches, "age").await;
                }
            }
        }
        info!("batcher drained");
    }

    async fn flush(
        &self,
        current: &mut Vec<DataPoint>,
        started: &mut Option<Instant>,
        batches: &mpsc::Sender<Batch>,
        trigger: &str,
    ) {
        if current.is_empty() {
            *started = None;
            return;
        }
        let created_at = started.take().unwrap_or_else(Instant::now);
        let points = std::mem::replace(current, self.pool.take());

        metrics::BATCH_SIZE
            .with_label_values(&[trigger])
            .observe(points.len() as f64);
        metrics::FLUSHES.with_label_values(&[trigger]).inc();
        debug!(count = points.len(), trigger = trigger, "flushing batch");

        let batch = Batch { points, created_at };
        // Writers apply backpressure here; the bounded point channel
        // upstream is the drop point, never this send.
        if batches.send(batch).await.is_err() {
            debug!("batch channel closed, discarding flush");
        }
    }
}

async fn age_elapsed(started: Option<Instant>, interval: std::time::Duration) {
    match started {
        Some(t0) => tokio::time::sleep_until(t0 + interval).await,
        None => std::future::pending().await,
    }
}

/// Non-blocking admission: enqueue or drop-with-counter. This is the
/// pipeline's sole admission-control mechanism.
pub fn offer(tx: &mpsc::Sender<DataPoint>, point: DataPoint, capacity: usize) -> bool {
    match tx.try_send(point) {
        Ok(()) => {
            metrics::QUEUE_DEPTH.set((capacity - tx.capacity()) as i64);
            true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            metrics::INGEST_DROPPED.inc();
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
