//! Shared-subscription MQTT consumer.
//!
//! One persistent session (`clean_session=false`) subscribed under the
//! `$share/{group}/...` filters, so the broker load-balances messages
//! across ingestion replicas, so each message reaches exactly one
//! instance.
//! Parsed points are offered to the backpressure queue with a
//! non-blocking send; overflow drops the point and bumps the counter.

use super::batcher::offer;
use crate::config::IngestConfig;
use crate::error::{IngestError, IngestResult};
use crate::metrics;
use crate::model::DataPoint;
use crate::mqtt::{payload, session_options};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct IngestSubscriber;

impl IngestSubscriber {
    /// Spawn the consumer loop. Points flow into `tx`; the task exits
    /// when `cancel` fires, dropping its sender so the batcher drains.
    pub fn start(
        config: &IngestConfig,
        tx: mpsc::Sender<DataPoint>,
        cancel: CancellationToken,
    ) -> IngestResult<()> {
        let options =
            session_options(&config.mqtt).map_err(|e| IngestError::Mqtt(e.to_string()))?;
        let (client, mut eventloop) = AsyncClient::new(options, 256);
        let filters = config.shared_topics();
        let queue_capacity = config.queue_capacity;
        let reconnect_base = config.mqtt.reconnect_base();

        tokio::spawn(async move {
            let mut consecutive_failures: u32 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = client.disconnect().await;
                        info!("ingestion subscriber stopped");
                        break;
                    }
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            consecutive_failures = 0;
                            metrics::INGEST_MQTT_CONNECTED.set(1);
                            info!(filters = filters.len(), "ingestion session established");
                            for filter in &filters {
                                if let Err(e) =
                                    client.subscribe(filter, QoS::AtLeastOnce).await
                                {
                                    warn!(filter = %filter, error = %e, "subscribe failed");
                                }
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            handle_message(
                                &publish.topic,
                                &publish.payload,
                                &tx,
                                queue_capacity,
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            metrics::INGEST_MQTT_CONNECTED.set(0);
                            let factor = 1u64 << consecutive_failures.min(16);
                            let delay = reconnect_base.saturating_mul(factor as u32);
                            consecutive_failures = consecutive_failures.saturating_add(1);
                            warn!(
                                error = %e,
                                retry_in_secs = delay.as_secs(),
                                "ingestion session lost"
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }
}

/// Parse one broker message and offer it to the queue. Never blocks.
fn handle_message(
    topic: &str,
    bytes: &[u8],
    tx: &mpsc::Sender<DataPoint>,
    queue_capacity: usize,
) {
    match payload::parse(topic, bytes, Utc::now()) {
        Ok(point) => {
            metrics::INGEST_RECEIVED.inc();
            if !offer(tx, point, queue_capacity) {
                debug!(topic = topic, "queue full, point dropped");
            }
        }
        Err(e) => {
            metrics::INGEST_PARSE_ERRORS.inc();
            debug!(topic = topic, error = %e, "unparseable payload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;

    #[tokio::test]
    async fn valid_messages_land_in_the_queue() {
        let (tx, mut rx) = mpsc::channel(8);
        handle_message("acme/plc-001/temperature", br#"{"v": 2.5, "q": "good"}"#, &tx, 8);
        let point = rx.recv().await.unwrap();
        assert_eq!(point.topic, "acme/plc-001/temperature");
        assert_eq!(point.value, Value::Float(2.5));
        assert!(point.received_at.is_some());
    }

    #[tokio::test]
    async fn garbage_messages_are_counted_not_queued() {
        let (tx, mut rx) = mpsc::channel(8);
        handle_message("t", b"not json at all", &tx, 8);
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn overflow_drops_without_blocking() {
        let (tx, mut _rx) = mpsc::channel(2);
        for _ in 0..5 {
            handle_message("t", br#"{"v": 1}"#, &tx, 2);
        }
        // The sender must still be usable and the call must have
        // returned; receiving drains exactly the capacity.
        let mut received = 0;
        while let Ok(p) = _rx.try_recv() {
            assert_eq!(p.value, Value::Int(1));
            received += 1;
        }
        assert_eq!(received, 2);
    }
}
