//! MQTT publisher with a persistent session and an offline buffer.
//!
//! One session per service. The event-loop task owns reconnection:
//! backoff starts at the configured base and doubles, deliberately
//! uncapped. Messages submitted while disconnected land in a bounded
//! FIFO; overflow evicts the oldest message and bumps a counter. On
//! reconnect the buffer drains and subscriptions are re-established.
//! Inbound publishes (commands, config events) are forwarded to the
//! channel handed in at startup.

use super::{payload, session_options};
use crate::config::MqttConfig;
use crate::error::GatewayResult;
use crate::metrics;
use crate::model::DataPoint;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, Publish, QoS};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Message parked while the session is down.
#[derive(Debug, Clone)]
struct Buffered {
    topic: String,
    qos: QoS,
    payload: Vec<u8>,
}

struct PublisherState {
    connected: AtomicBool,
    capacity: usize,
    buffer: Mutex<VecDeque<Buffered>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
}

impl PublisherState {
    fn new(capacity: usize) -> Self {
        PublisherState {
            connected: AtomicBool::new(false),
            capacity,
            buffer: Mutex::new(VecDeque::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn park(&self, msg: Buffered) {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            metrics::PUBLISH_BUFFER_EVICTIONS.inc();
        }
        buffer.push_back(msg);
        metrics::PUBLISH_BUFFER_DEPTH.set(buffer.len() as i64);
    }

    fn drain(&self) -> Vec<Buffered> {
        let mut buffer = self.buffer.lock().unwrap();
        let drained: Vec<Buffered> = buffer.drain(..).collect();
        metrics::PUBLISH_BUFFER_DEPTH.set(0);
        drained
    }

    fn buffered(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    state: Arc<PublisherState>,
}

impl MqttPublisher {
    /// Create the session and spawn its event-loop task. `incoming`
    /// receives every inbound publish (commands and config events).
    pub fn start(
        config: &MqttConfig,
        incoming: Option<mpsc::Sender<Publish>>,
        cancel: CancellationToken,
    ) -> GatewayResult<Arc<Self>> {
        let options = session_options(config)?;
        let (client, eventloop) = AsyncClient::new(options, 128);
        let state = Arc::new(PublisherState::new(config.buffer_size));

        let publisher = Arc::new(MqttPublisher {
            client: client.clone(),
            state: state.clone(),
        });

        tokio::spawn(run_event_loop(
            eventloop,
            client,
            state,
            incoming,
            cancel,
            config.reconnect_base(),
        ));

        Ok(publisher)
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    pub fn buffered(&self) -> usize {
        self.state.buffered()
    }

    /// Publish or, while disconnected, park in the offline buffer.
    pub async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) {
        if self.state.connected.load(Ordering::Acquire) {
            if let Err(e) = self.client.publish(topic, qos, false, payload).await {
                warn!(topic = topic, error = %e, "publish failed");
            }
        } else {
            self.state.park(Buffered {
                topic: topic.to_string(),
                qos,
                payload,
            });
        }
    }

    /// Publish one datapoint to its topic at QoS 1.
    pub async fn publish_point(&self, point: &DataPoint) {
        self.publish(&point.topic, QoS::AtLeastOnce, payload::encode(point))
            .await;
        metrics::POINTS_PUBLISHED.inc();
    }

    /// Best-effort group publish: individual failures are logged, the
    /// rest of the batch proceeds.
    pub async fn publish_batch(&self, points: &[DataPoint]) {
        for point in points {
            self.publish_point(point).await;
        }
    }

    /// Subscribe now and after every reconnect.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> GatewayResult<()> {
        self.state
            .subscriptions
            .lock()
            .unwrap()
            .push((filter.to_string(), qos));
        if let Err(e) = self.client.subscribe(filter, qos).await {
            // The subscription list replays on the next connack.
            debug!(filter = filter, error = %e, "subscribe deferred until session is up");
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        let _ = self.client.disconnect().await;
    }

    /// Parked messages as `(topic, payload)`, for assertions.
    #[cfg(test)]
    pub(crate) fn parked_messages(&self) -> Vec<(String, Vec<u8>)> {
        self.state
            .buffer
            .lock()
            .unwrap()
            .iter()
            .map(|m| (m.topic.clone(), m.payload.clone()))
            .collect()
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    state: Arc<PublisherState>,
    incoming: Option<mpsc::Sender<Publish>>,
    cancel: CancellationToken,
    reconnect_base: std::time::Duration,
) {
    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("mqtt event loop stopped");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    consecutive_failures = 0;
                    state.connected.store(true, Ordering::Release);
                    metrics::MQTT_CONNECTED.set(1);
                    info!("mqtt session established");
                    resubscribe(&client, &state).await;
                    drain_buffer(&client, &state).await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if let Some(tx) = &incoming {
                        if tx.send(publish).await.is_err() {
                            // Receiver gone; the service is shutting down.
                            break;
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    state.connected.store(false, Ordering::Release);
                    metrics::MQTT_CONNECTED.set(0);
                    warn!("broker sent disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    state.connected.store(false, Ordering::Release);
                    metrics::MQTT_CONNECTED.set(0);
                    // Doubling backoff, uncapped; the shift is clamped
                    // only to keep the arithmetic finite.
                    let factor = 1u64 << consecutive_failures.min(16);
                    let delay = reconnect_base.saturating_mul(factor as u32);
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!(
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "mqtt connection lost"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

async fn resubscribe(client: &AsyncClient, state: &PublisherState) {
    let subscriptions = state.subscriptions.lock().unwrap().clone();
    for (filter, qos) in subscriptions {
        if let Err(e) = client.subscribe(&filter, qos).await {
            warn!(filter = %filter, error = %e, "resubscribe failed");
        }
    }
}

async fn drain_buffer(client: &AsyncClient, state: &PublisherState) {
    let parked = state.drain();
    if parked.is_empty() {
        return;
    }
    info!(count = parked.len(), "draining offline publish buffer");
    for msg in parked {
        if let Err(e) = client.publish(&msg.topic, msg.qos, false, msg.payload).await {
            warn!(topic = %msg.topic, error = %e, "buffered publish failed");
        }
    }
}
