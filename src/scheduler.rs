//! Per-device polling scheduler.
//!
//! One tokio task per device, ticking at the device's own cadence. Every
//! tick takes a permit from the global worker semaphore before touching
//! the pool, so at most `worker_count` devices poll concurrently while
//! each device stays strictly serialized by its single-task loop. Good
//! points are published; every point, good or bad, feeds the metrics.
//! Tags with a deadband only publish when the value moved far enough
//! from the last published one.

use crate::metrics;
use crate::model::{DataPoint, Device, DeviceStatus, Tag};
use crate::mqtt::publisher::MqttPublisher;
use crate::pool::PoolManager;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RESULT_UNKNOWN: u8 = 0;
const RESULT_OK: u8 = 1;
const RESULT_ERROR: u8 = 2;

/// Counters for one device, written by its poller, read by `/status`.
#[derive(Default)]
pub struct PollStats {
    pub poll_count: AtomicU64,
    pub error_count: AtomicU64,
    pub points_read: AtomicU64,
    last_result: AtomicU8,
    last_poll: StdMutex<Option<DateTime<Utc>>>,
    last_error: StdMutex<Option<String>>,
}

impl PollStats {
    fn record_success(&self, points: u64) {
        self.poll_count.fetch_add(1, Ordering::Relaxed);
        self.points_read.fetch_add(points, Ordering::Relaxed);
        self.last_result.store(RESULT_OK, Ordering::Relaxed);
        *self.last_poll.lock().unwrap() = Some(Utc::now());
    }

    fn record_error(&self, error: String) {
        self.poll_count.fetch_add(1, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.last_result.store(RESULT_ERROR, Ordering::Relaxed);
        *self.last_poll.lock().unwrap() = Some(Utc::now());
        *self.last_error.lock().unwrap() = Some(error);
    }

    pub fn status(&self) -> DeviceStatus {
        match self.last_result.load(Ordering::Relaxed) {
            RESULT_OK => DeviceStatus::Online,
            RESULT_ERROR => DeviceStatus::Error,
            _ => DeviceStatus::Unknown,
        }
    }
}

/// Point-in-time view of one device's poller for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub status: DeviceStatus,
    pub poll_count: u64,
    pub error_count: u64,
    pub points_read: u64,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct PollerHandle {
    device: Arc<Device>,
    stats: Arc<PollStats>,
    cancel: CancellationToken,
}

pub struct PollScheduler {
    pools: Arc<PoolManager>,
    publisher: Arc<MqttPublisher>,
    workers: Arc<Semaphore>,
    worker_count: usize,
    pollers: RwLock<HashMap<String, PollerHandle>>,
    running: AtomicBool,
    cancel: CancellationToken,
}

impl PollScheduler {
    pub fn new(
        pools: Arc<PoolManager>,
        publisher: Arc<MqttPublisher>,
        worker_count: usize,
        cancel: CancellationToken,
    ) -> Self {
        PollScheduler {
            pools,
            publisher,
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            pollers: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            cancel,
        }
    }

    /// Wait until no poll cycle is in flight: taking every worker permit
    /// proves no poller holds one. Call after [`stop`](Self::stop), as
    /// the shutdown drain barrier.
    pub async fn drain(&self) {
        let _all = self.workers.acquire_many(self.worker_count as u32).await;
    }

    /// Start pollers for everything registered so far. Devices registered
    /// afterwards start immediately.
    pub async fn start(&self) {
        self.running.store(true, Ordering::Release);
        let pollers = self.pollers.read().await;
        for handle in pollers.values() {
            self.spawn_poller(handle);
        }
        info!(devices = pollers.len(), "polling scheduler started");
    }

    /// Register (or re-register) a device. Safe at any time; an existing
    /// poller for the same id is stopped first.
    pub async fn register(&self, device: Arc<Device>) {
        let mut pollers = self.pollers.write().await;
        if let Some(previous) = pollers.remove(&device.id) {
            previous.cancel.cancel();
        }

        if !device.enabled {
            debug!(device = %device.id, "device disabled, not polling");
            return;
        }

        let handle = PollerHandle {
            device: device.clone(),
            stats: Arc::new(PollStats::default()),
            cancel: self.cancel.child_token(),
        };
        if self.running.load(Ordering::Acquire) {
            self.spawn_poller(&handle);
        }
        pollers.insert(device.id.clone(), handle);
        info!(device = %device.id, interval_ms = device.poll_interval_ms, "device registered");
    }

    /// Stop and forget a device's poller.
    pub async fn unregister(&self, device_id: &str) {
        if let Some(handle) = self.pollers.write().await.remove(device_id) {
            handle.cancel.cancel();
            info!(device = %device_id, "device unregistered");
        }
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let pollers = self.pollers.read().await;
        for handle in pollers.values() {
            handle.cancel.cancel();
        }
        info!("polling scheduler stopped");
    }

    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let pollers = self.pollers.read().await;
        let mut out: Vec<DeviceSnapshot> = pollers
            .values()
            .map(|h| DeviceSnapshot {
                device_id: h.device.id.clone(),
                status: h.stats.status(),
                poll_count: h.stats.poll_count.load(Ordering::Relaxed),
                error_count: h.stats.error_count.load(Ordering::Relaxed),
                points_read: h.stats.points_read.load(Ordering::Relaxed),
                last_poll: *h.stats.last_poll.lock().unwrap(),
                last_error: h.stats.last_error.lock().unwrap().clone(),
            })
            .collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    pub async fn device_count(&self) -> usize {
        self.pollers.read().await.len()
    }

    fn spawn_poller(&self, handle: &PollerHandle) {
        let device = handle.device.clone();
        let stats = handle.stats.clone();
        let cancel = handle.cancel.clone();
        let pools = self.pools.clone();
        let publisher = self.publisher.clone();
        let workers = self.workers.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(device.poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Last published value per tag, for deadband suppression.
            let mut last_published: HashMap<String, f64> = HashMap::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = workers.clone().acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };

                poll_once(&pools, &publisher, &device, &stats, &mut last_published).await;
                drop(permit);
            }
            debug!(device = %device.id, "poller exited");
        });
    }
}

/// One poll cycle: read every enabled tag with a deadline of twice the
/// connect timeout, meter everything, publish what passes the quality
/// and deadband gates.
async fn poll_once(
    pools: &PoolManager,
    publisher: &MqttPublisher,
    device: &Device,
    stats: &PollStats,
    last_published: &mut HashMap<String, f64>,
) {
    let tags: Vec<Tag> = device.enabled_tags().cloned().collect();
    if tags.is_empty() {
        return;
    }

    let started = Instant::now();
    let deadline = device.connection.connect_timeout() * 2;
    let result = tokio::time::timeout(deadline, pools.read_tags(device, &tags)).await;

    let points = match result {
        Ok(Ok(points)) => points,
        Ok(Err(e)) => {
            warn!(device = %device.id, error = %e, "poll failed");
            metrics::POLL_ERRORS.with_label_values(&[&device.id]).inc();
            stats.record_error(e.to_string());
            return;
        }
        Err(_) => {
            warn!(device = %device.id, deadline_ms = deadline.as_millis() as u64, "poll deadline exceeded");
            metrics::POLL_ERRORS.with_label_values(&[&device.id]).inc();
            stats.record_error("poll deadline exceeded".to_string());
            return;
        }
    };

    metrics::POLL_DURATION
        .with_label_values(&[&device.id])
        .observe(started.elapsed().as_secs_f64());

    // Points come back in tag order; pair them up for topics/deadband.
    let mut to_publish: Vec<DataPoint> = Vec::with_capacity(points.len());
    let mut good = 0u64;
    for (tag, mut point) in tags.iter().zip(points) {
        metrics::POINTS_READ
            .with_label_values(&[&device.id, point.quality.as_str()])
            .inc();
        if !point.quality.is_good() {
            continue;
        }
        good += 1;
        point.topic = device.topic_for(tag);

        if let Some(deadband) = tag.deadband {
            if let Some(current) = point.value.as_f64() {
                let last = last_published.get(&tag.id).copied();
                if !passes_deadband(last, current, deadband) {
                    continue;
                }
                last_published.insert(tag.id.clone(), current);
            }
        }
        to_publish.push(point);
    }

    if good == 0 && !tags.is_empty() {
        // The transport answered but produced no usable reading.
        metrics::POLL_ERRORS.with_label_values(&[&device.id]).inc();
        stats.record_error("no readable tags".to_string());
    } else {
        stats.record_success(good);
    }

    if !to_publish.is_empty() {
        publisher.publish_batch(&to_publish).await;
    }
}

/// Absolute deadband: publish only when no previous value exists or the
/// change reaches the threshold.
fn passes_deadband(last: Option<f64>, current: f64, deadband: f64) -> bool {
    match last {
        None => true,
        Some(last) => (current - last).abs() >= deadband,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::config::{MqttConfig, PoolSettings};
    use crate::model::{AccessMode, ByteOrder, ConnectionParams, DataType, Protocol, Value};
    use crate::pool::ConnectionPool;
    use crate::protocols::testutil::ScriptedClient;
    use crate::protocols::{ProtocolClient, RawReading};
    use std::time::Duration;

    fn test_device(id: &str, poll_ms: u64) -> Device {
        Device {
            id: id.to_string(),
            name: String::new(),
            protocol: Protocol::ModbusTcp,
            connection: ConnectionParams {
                endpoint: "127.0.0.1:502".into(),
                unit_id: Some(1),
                baud_rate: None,
                rack: None,
                slot: None,
                security_policy: None,
                security_mode: None,
                username: None,
                password: None,
                cert_path: None,
                key_path: None,
                connect_timeout_ms: 200,
            },
            poll_interval_ms: poll_ms,
            uns_prefix: format!("acme/site1/{}", id),
            enabled: true,
            tags: vec![Tag {
                id: "temperature".into(),
                name: String::new(),
                address: "40001".into(),
                data_type: DataType::Int16,
                register_type: None,
                byte_order: ByteOrder::BigEndian,
                bit: None,
                scale: 1.0,
                offset: 0.0,
                unit: "°C".into(),
                access: AccessMode::Read,
                enabled: true,
                topic_suffix: "temperature".into(),
                deadband: None,
            }],
        }
    }

    fn scripted_pools() -> Arc<PoolManager> {
        // A manager whose modbus-tcp pool always yields Good points,
        // injected through the factory seam.
        Arc::new(PoolManager::with_pool_for_tests(
            Protocol::ModbusTcp,
            ConnectionPool::with_factory(
                Protocol::ModbusTcp,
                PoolSettings::default(),
                CircuitBreaker::new("test", BreakerConfig::default()),
                Box::new(|device| {
                    let script = (0..256)
                        .map(|i| Ok(RawReading::new(Value::Int(i as i64))))
                        .collect::<Vec<_>>();
                    Ok(Box::new(ScriptedClient::new(&device.id, script))
                        as Box<dyn ProtocolClient>)
                }),
            ),
        ))
    }

    fn offline_publisher() -> Arc<MqttPublisher> {
        // Broker is unreachable; publishes park in the offline buffer,
        // which is exactly what the assertions read.
        let config = MqttConfig {
            broker_url: "mqtt://127.0.0.1:1".into(),
            client_id: "sched-test".into(),
            reconnect_base_secs: 60,
            ..Default::default()
        };
        MqttPublisher::start(&config, None, CancellationToken::new()).unwrap()
    }

    #[test]
    fn deadband_gate() {
        // First value always passes.
        assert!(passes_deadband(None, 10.0, 0.5));
        // Oscillation below the band is suppressed.
        assert!(!passes_deadband(Some(10.0), 10.3, 0.5));
        assert!(!passes_deadband(Some(10.0), 9.7, 0.5));
        // A real move passes.
        assert!(passes_deadband(Some(10.0), 11.0, 0.5));
        assert!(passes_deadband(Some(10.0), 10.5, 0.5));
    }

    #[tokio::test]
    async fn registered_device_polls_and_buffers_points() {
        let scheduler = PollScheduler::new(
            scripted_pools(),
            offline_publisher(),
            4,
            CancellationToken::new(),
        );
        scheduler.start().await;
        scheduler
            .register(Arc::new(test_device("plc-001", 20)))
            .await;

        tokio::time::sleep(Duration::from_millis(150)).await;

        let snapshots = scheduler.snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].status, DeviceStatus::Online);
        assert!(snapshots[0].poll_count >= 2, "expected several polls");
        assert!(snapshots[0].points_read >= 2);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn unregister_stops_polling() {
        let scheduler = PollScheduler::new(
            scripted_pools(),
            offline_publisher(),
            4,
            CancellationToken::new(),
        );
        scheduler.start().await;
        scheduler
            .register(Arc::new(test_device("plc-001", 20)))
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.unregister("plc-001").await;
        assert!(scheduler.snapshots().await.is_empty());
        assert_eq!(scheduler.device_count().await, 0);
    }

    #[tokio::test]
    async fn disabled_devices_are_not_polled() {
        let scheduler = PollScheduler::new(
            scripted_pools(),
            offline_publisher(),
            4,
            CancellationToken::new(),
        );
        scheduler.start().await;
        let mut device = test_device("plc-002", 20);
        device.enabled = false;
        scheduler.register(Arc::new(device)).await;
        assert_eq!(scheduler.device_count().await, 0);
    }

    #[tokio::test]
    async fn status_unknown_before_first_poll() {
        let stats = PollStats::default();
        assert_eq!(stats.status(), DeviceStatus::Unknown);
        stats.record_success(3);
        assert_eq!(stats.status(), DeviceStatus::Online);
        stats.record_error("boom".into());
        assert_eq!(stats.status(), DeviceStatus::Error);
    }
}
