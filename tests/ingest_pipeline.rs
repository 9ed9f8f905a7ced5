//! Backpressure and batching properties of the ingestion path under
//! burst load, exercised without a broker or store: points are offered
//! straight into the bounded queue and the flushed batches are counted
//! on the writer side of the channel.

use nexus_edge::ingest::batcher::{offer, Batch, BatchPool, Batcher};
use nexus_edge::model::{DataPoint, Quality, Value};
use std::time::Duration;
use tokio::sync::mpsc;

fn point(n: usize) -> DataPoint {
    DataPoint {
        topic: format!("acme/site1/line2/plc-001/tag{}", n % 50),
        device_id: "plc-001".into(),
        tag_id: format!("tag{}", n % 50),
        value: Value::Float(n as f64),
        quality: Quality::Good,
        unit: String::new(),
        source_ts: None,
        server_ts: None,
        received_at: None,
    }
}

#[tokio::test]
async fn burst_never_blocks_and_accounting_balances() {
    const QUEUE_CAPACITY: usize = 5_000;
    const BATCH_SIZE: usize = 500;
    const TOTAL: usize = 20_000;

    let pool = BatchPool::new(BATCH_SIZE, 16);
    let (point_tx, point_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (batch_tx, mut batch_rx) = mpsc::channel::<Batch>(64);

    let batcher = Batcher::new(BATCH_SIZE, Duration::from_millis(100), pool.clone());
    let batcher_task = tokio::spawn(batcher.run(point_rx, batch_tx));

    // Writer stand-in: counts points and recycles vectors like the real
    // bulk writer does.
    let writer_pool = pool.clone();
    let counter = tokio::spawn(async move {
        let mut written = 0usize;
        let mut batches = 0usize;
        let mut oversized = 0usize;
        while let Some(batch) = batch_rx.recv().await {
            written += batch.len();
            batches += 1;
            if batch.len() > BATCH_SIZE {
                oversized += 1;
            }
            writer_pool.put(batch.into_points());
        }
        (written, batches, oversized)
    });

    // Burst from the producer side; `offer` must never block, only
    // accept or drop.
    let mut accepted = 0usize;
    let mut dropped = 0usize;
    for n in 0..TOTAL {
        if offer(&point_tx, point(n), QUEUE_CAPACITY) {
            accepted += 1;
        } else {
            dropped += 1;
        }
        // Brief yields let the batcher drain, as the broker event loop
        // naturally would between messages.
        if n % 1_000 == 0 {
            tokio::task::yield_now().await;
        }
    }
    assert_eq!(accepted + dropped, TOTAL);

    // Drain: closing the input flushes the pending batch.
    drop(point_tx);
    batcher_task.await.unwrap();
    let (written, batches, oversized) = counter.await.unwrap();

    // Accounting: received − dropped = written, nothing lost in between.
    assert_eq!(written, accepted);
    assert_eq!(oversized, 0, "no batch may exceed the batch size");
    assert!(
        batches >= accepted / BATCH_SIZE,
        "expected at least {} batches, saw {}",
        accepted / BATCH_SIZE,
        batches
    );
}

#[tokio::test]
async fn slow_writers_backpressure_the_batcher_not_the_producer() {
    const QUEUE_CAPACITY: usize = 200;
    const BATCH_SIZE: usize = 50;

    let pool = BatchPool::new(BATCH_SIZE, 4);
    let (point_tx, point_rx) = mpsc::channel(QUEUE_CAPACITY);
    // A tiny batch channel with no consumer: flushes park here.
    let (batch_tx, batch_rx) = mpsc::channel::<Batch>(1);

    let batcher = Batcher::new(BATCH_SIZE, Duration::from_millis(10), pool);
    let batcher_task = tokio::spawn(batcher.run(point_rx, batch_tx));

    // Overfill: the producer must keep returning instantly even though
    // nothing downstream consumes.
    let mut dropped = 0usize;
    for n in 0..2_000 {
        if !offer(&point_tx, point(n), QUEUE_CAPACITY) {
            dropped += 1;
        }
    }
    assert!(dropped > 0, "queue must overflow by construction");

    // Unstick and drain.
    drop(point_tx);
    let mut rx = batch_rx;
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
    batcher_task.await.unwrap();
    drain.await.unwrap();
}
