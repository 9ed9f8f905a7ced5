//! Per-protocol connection pools.
//!
//! One pool per protocol, keyed by device id. Live connections are
//! bounded by a semaphore whose permits live inside the pool entries, so
//! capacity frees exactly when an entry is removed. Each entry guards its
//! client with a mutex: concurrent reads on one device would interleave
//! request/response framing, so they queue instead. A circuit breaker
//! wraps every pool call; it is the pool's breaker, not the device's, so
//! a site-wide outage trips once.
//!
//! Two background loops per pool: a health checker that probes each
//! connection and evicts the unhealthy, and an idle reaper that closes
//! connections unused for longer than the idle timeout.

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::PoolSettings;
use crate::error::{ProtocolError, ProtocolResult};
use crate::metrics;
use crate::model::{DataPoint, Device, Protocol, Quality, Tag, Value};
use crate::protocols::{self, ProtocolClient};
use crate::retry::RetryPolicy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pluggable client constructor, the seam tests use to inject scripted
/// clients.
pub type ClientFactory =
    Box<dyn Fn(&Device) -> ProtocolResult<Box<dyn ProtocolClient>> + Send + Sync>;

struct PoolEntry {
    device_id: String,
    client: Mutex<Box<dyn ProtocolClient>>,
    last_used: StdMutex<Instant>,
    /// Holds one unit of pool capacity for as long as the entry lives.
    _permit: OwnedSemaphorePermit,
}

impl PoolEntry {
    fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> std::time::Duration {
        self.last_used.lock().unwrap().elapsed()
    }
}

pub struct ConnectionPool {
    protocol: Protocol,
    settings: PoolSettings,
    breaker: Arc<CircuitBreaker>,
    capacity: Arc<Semaphore>,
    entries: RwLock<HashMap<String, Arc<PoolEntry>>>,
    factory: ClientFactory,
}

impl ConnectionPool {
    pub fn new(
        protocol: Protocol,
        settings: PoolSettings,
        breaker: CircuitBreaker,
        retry_policy: RetryPolicy,
    ) -> Self {
        let factory: ClientFactory = Box::new(move |device: &Device| {
            protocols::create_client(device, retry_policy.clone())
        });
        Self::with_factory(protocol, settings, breaker, factory)
    }

    pub fn with_factory(
        protocol: Protocol,
        settings: PoolSettings,
        breaker: CircuitBreaker,
        factory: ClientFactory,
    ) -> Self {
        let capacity = Arc::new(Semaphore::new(settings.max_connections));
        ConnectionPool {
            protocol,
            settings,
            breaker: Arc::new(breaker),
            capacity,
            entries: RwLock::new(HashMap::new()),
            factory,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub async fn connection_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Fetch or lazily create the entry for a device. Blocks while the
    /// pool is at capacity until another entry is removed.
    async fn entry_for(&self, device: &Device) -> ProtocolResult<Arc<PoolEntry>> {
        if let Some(entry) = self.entries.read().await.get(&device.id) {
            return Ok(entry.clone());
        }

        let permit = self
            .capacity
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::ConnectionClosed("pool closed".into()))?;

        let mut entries = self.entries.write().await;
        // Someone else may have created it while we waited for capacity.
        if let Some(entry) = entries.get(&device.id) {
            return Ok(entry.clone());
        }

        let client = (self.factory)(device)?;
        let entry = Arc::new(PoolEntry {
            device_id: device.id.clone(),
            client: Mutex::new(client),
            last_used: StdMutex::new(Instant::now()),
            _permit: permit,
        });
        entries.insert(device.id.clone(), entry.clone());
        metrics::POOL_CONNECTIONS
            .with_label_values(&[&self.protocol.to_string()])
            .set(entries.len() as i64);
        debug!(protocol = %self.protocol, device = %device.id, "pool entry created");
        Ok(entry)
    }

    fn record_breaker(&self, success: bool) {
        self.breaker.record(success);
        metrics::BREAKER_STATE
            .with_label_values(&[&self.protocol.to_string()])
            .set(match self.breaker.state() {
                BreakerState::Closed => 0,
                BreakerState::Open => 1,
                BreakerState::HalfOpen => 2,
            });
    }

    /// Read a batch of tags from one device. Per-device serialization is
    /// enforced by the entry mutex; the breaker counts a transport-class
    /// failure (timeout / not-connected points) against the pool.
    pub async fn read_tags(
        &self,
        device: &Device,
        tags: &[Tag],
    ) -> ProtocolResult<Vec<DataPoint>> {
        self.breaker.try_acquire()?;

        let entry = match self.entry_for(device).await {
            Ok(entry) => entry,
            Err(e) => {
                self.record_breaker(false);
                return Err(e);
            }
        };

        let mut client = entry.client.lock().await;
        let points = client.read_tags(tags).await;
        drop(client);
        entry.touch();

        let transport_failure = points
            .iter()
            .any(|p| matches!(p.quality, Quality::Timeout | Quality::NotConnected));
        self.record_breaker(!transport_failure);
        Ok(points)
    }

    /// Write one tag on one device under the same breaker policy.
    pub async fn write_tag(
        &self,
        device: &Device,
        tag: &Tag,
        value: &Value,
    ) -> ProtocolResult<()> {
        self.breaker.try_acquire()?;

        let entry = match self.entry_for(device).await {
            Ok(entry) => entry,
            Err(e) => {
                self.record_breaker(false);
                return Err(e);
            }
        };

        let mut client = entry.client.lock().await;
        let result = client.write_tag(tag, value).await;
        drop(client);
        entry.touch();

        // Validation rejections say nothing about transport health.
        let success = match &result {
            Ok(()) => true,
            Err(e) => e.is_fatal(),
        };
        self.record_breaker(success);
        result
    }

    /// Drop a device's connection, closing the transport.
    pub async fn remove(&self, device_id: &str) {
        let removed = self.entries.write().await.remove(device_id);
        if let Some(entry) = removed {
            let mut client = entry.client.lock().await;
            let _ = client.disconnect().await;
            info!(protocol = %self.protocol, device = %device_id, "pool entry removed");
        }
        metrics::POOL_CONNECTIONS
            .with_label_values(&[&self.protocol.to_string()])
            .set(self.entries.read().await.len() as i64);
    }

    /// Probe every connection; evict the ones that fail so the next
    /// demand recreates them.
    async fn health_sweep(&self) {
        let entries: Vec<Arc<PoolEntry>> =
            self.entries.read().await.values().cloned().collect();

        for entry in entries {
            // Skip entries busy with real traffic; they are evidently
            // healthy enough to be in use.
            let Ok(mut client) = entry.client.try_lock() else {
                continue;
            };
            if !client.is_connected() {
                continue;
            }
            if let Err(e) = client.probe().await {
                warn!(
                    protocol = %self.protocol,
                    device = %entry.device_id,
                    error = %e,
                    "health check failed, evicting connection"
                );
                let _ = client.disconnect().await;
                drop(client);
                self.remove(&entry.device_id).await;
            }
        }
    }

    /// Close connections unused for longer than the idle timeout.
    async fn idle_sweep(&self) {
        let idle: Vec<String> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.idle_for() > self.settings.idle_timeout())
            .map(|e| e.device_id.clone())
            .collect();

        for device_id in idle {
            debug!(protocol = %self.protocol, device = %device_id, "closing idle connection");
            self.remove(&device_id).await;
        }
    }

    /// Spawn the health-check and idle-reaper loops until `cancel` fires.
    pub fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) {
        let health_pool = self.clone();
        let health_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_pool.settings.health_check_period());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = health_cancel.cancelled() => break,
                    _ = ticker.tick() => health_pool.health_sweep().await,
                }
            }
        });

        let reaper_pool = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(reaper_pool.settings.idle_timeout() / 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => reaper_pool.idle_sweep().await,
                }
            }
        });
    }

    /// Disconnect everything. Called during shutdown.
    pub async fn close(&self) {
        let device_ids: Vec<String> =
            self.entries.read().await.keys().cloned().collect();
        for device_id in device_ids {
            self.remove(&device_id).await;
        }
    }
}

/// The gateway's set of pools, one per protocol in use.
pub struct PoolManager {
    pools: HashMap<Protocol, Arc<ConnectionPool>>,
}

impl PoolManager {
    pub fn new(
        settings: PoolSettings,
        breaker_config: crate::breaker::BreakerConfig,
        retry_policy: RetryPolicy,
    ) -> Self {
        let mut pools = HashMap::new();
        for protocol in [
            Protocol::ModbusTcp,
            Protocol::ModbusRtu,
            Protocol::OpcUa,
            Protocol::S7,
        ] {
            pools.insert(
                protocol,
                Arc::new(ConnectionPool::new(
                    protocol,
                    settings.clone(),
                    CircuitBreaker::new(protocol.to_string(), breaker_config.clone()),
                    retry_policy.clone(),
                )),
            );
        }
        PoolManager { pools }
    }

    pub fn pool(&self, protocol: Protocol) -> Arc<ConnectionPool> {
        // All four protocols are populated in the constructor.
        self.pools[&protocol].clone()
    }

    /// Manager backed by a single injected pool, for scheduler and
    /// command tests.
    #[cfg(test)]
    pub(crate) fn with_pool_for_tests(protocol: Protocol, pool: ConnectionPool) -> Self {
        let mut pools = HashMap::new();
        pools.insert(protocol, Arc::new(pool));
        PoolManager { pools }
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<ConnectionPool>> {
        self.pools.values()
    }

    pub fn spawn_maintenance(&self, cancel: &CancellationToken) {
        for pool in self.pools.values() {
            pool.spawn_maintenance(cancel.clone());
        }
    }

    pub async fn read_tags(
        &self,
        device: &Device,
        tags: &[Tag],
    ) -> ProtocolResult<Vec<DataPoint>> {
        self.pool(device.protocol).read_tags(device, tags).await
    }

    pub async fn write_tag(
        &self,
        device: &Device,
        tag: &Tag,
        value: &Value,
    ) -> ProtocolResult<()> {
        self.pool(device.protocol).write_tag(device, tag, value).await
    }

    pub async fn remove_device(&self, device: &Device) {
        self.pool(device.protocol).remove(&device.id).await;
    }

    pub async fn close(&self) {
        for pool in self.pools.values() {
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::error::ProtocolError;
    use crate::model::{AccessMode, ByteOrder, ConnectionParams, DataType};
    use crate::protocols::testutil::ScriptedClient;
    use crate::protocols::RawReading;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn device(id: &str) -> Device {
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
                connect_timeout_ms: 100,
            },
            poll_interval_ms: 100,
            uns_prefix: format!("acme/{}", id),
            enabled: true,
            tags: vec![tag()],
        }
    }

    fn tag() -> Tag {
        Tag {
            id: "t1".into(),
            name: String::new(),
            address: "40001".into(),
            data_type: DataType::Int16,
            register_type: None,
            byte_order: ByteOrder::BigEndian,
            bit: None,
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
            access: AccessMode::ReadWrite,
            enabled: true,
            topic_suffix: "t1".into(),
            deadband: None,
        }
    }

    fn settings() -> PoolSettings {
        PoolSettings {
            max_connections: 4,
            idle_timeout_secs: 300,
            health_check_secs: 30,
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", BreakerConfig::default())
    }

    fn ok_pool(settings: PoolSettings) -> ConnectionPool {
        ConnectionPool::with_factory(
            Protocol::ModbusTcp,
            settings,
            breaker(),
            Box::new(|device| {
                Ok(Box::new(ScriptedClient::new(&device.id, vec![]))
                    as Box<dyn ProtocolClient>)
            }),
        )
    }

    fn failing_pool(settings: PoolSettings) -> ConnectionPool {
        ConnectionPool::with_factory(
            Protocol::ModbusTcp,
            settings,
            breaker(),
            Box::new(|device| {
                // Every wire exchange times out; retries exhaust to
                // Timeout-quality points.
                let script = (0..32)
                    .map(|_| Err(ProtocolError::Timeout))
                    .collect::<Vec<_>>();
                Ok(Box::new(ScriptedClient::new(&device.id, script))
                    as Box<dyn ProtocolClient>)
            }),
        )
    }

    #[tokio::test]
    async fn read_reuses_one_connection_per_device() {
        let pool = ok_pool(settings());
        let dev = device("plc-001");
        pool.read_tags(&dev, &dev.tags).await.unwrap();
        pool.read_tags(&dev, &dev.tags).await.unwrap();
        assert_eq!(pool.connection_count().await, 1);
    }

    #[tokio::test]
    async fn breaker_opens_after_failing_polls_and_fails_fast() {
        let pool = failing_pool(settings());
        let dev = device("plc-001");

        // Five transport-failing polls cross the 60%-of-5 threshold.
        for _ in 0..5 {
            let points = pool.read_tags(&dev, &dev.tags).await.unwrap();
            assert_eq!(points[0].quality, Quality::Timeout);
        }
        assert_eq!(pool.breaker_state(), BreakerState::Open);

        let err = pool.read_tags(&dev, &dev.tags).await.unwrap_err();
        assert!(matches!(err, ProtocolError::CircuitOpen));
    }

    #[tokio::test]
    async fn capacity_bounds_distinct_devices() {
        let pool = ok_pool(PoolSettings {
            max_connections: 1,
            ..settings()
        });
        let a = device("plc-a");
        let b = device("plc-b");

        pool.read_tags(&a, &a.tags).await.unwrap();
        assert_eq!(pool.connection_count().await, 1);

        // The second device cannot get a slot while the first holds it.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), pool.read_tags(&b, &b.tags)).await;
        assert!(blocked.is_err());

        // Freeing the first slot unblocks the second device.
        pool.remove(&a.id).await;
        tokio::time::timeout(Duration::from_millis(200), pool.read_tags(&b, &b.tags))
            .await
            .expect("slot should be free")
            .unwrap();
    }

    #[tokio::test]
    async fn remove_disconnects_and_frees_capacity() {
        let pool = ok_pool(settings());
        let dev = device("plc-001");
        pool.read_tags(&dev, &dev.tags).await.unwrap();
        assert_eq!(pool.connection_count().await, 1);

        pool.remove(&dev.id).await;
        assert_eq!(pool.connection_count().await, 0);
    }

    #[tokio::test]
    async fn idle_sweep_reaps_stale_connections() {
        let pool = ok_pool(PoolSettings {
            idle_timeout_secs: 0,
            ..settings()
        });
        let dev = device("plc-001");
        pool.read_tags(&dev, &dev.tags).await.unwrap();

        // idle_timeout of zero makes everything instantly stale.
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.idle_sweep().await;
        assert_eq!(pool.connection_count().await, 0);
    }

    #[tokio::test]
    async fn write_validation_errors_do_not_trip_breaker() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let pool = ConnectionPool::with_factory(
            Protocol::ModbusTcp,
            settings(),
            breaker(),
            Box::new(move |device| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(ScriptedClient::new(&device.id, vec![]))
                    as Box<dyn ProtocolClient>)
            }),
        );
        let dev = device("plc-001");
        let mut read_only = tag();
        read_only.access = AccessMode::Read;

        for _ in 0..6 {
            let err = pool
                .write_tag(&dev, &read_only, &Value::Int(1))
                .await
                .unwrap_err();
            assert!(matches!(err, ProtocolError::WriteNotPermitted));
        }
        assert_eq!(pool.breaker_state(), BreakerState::Closed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manager_routes_by_protocol() {
        let manager = PoolManager::new(
            settings(),
            BreakerConfig::default(),
            RetryPolicy::default(),
        );
        assert_eq!(
            manager.pool(Protocol::S7).protocol(),
            Protocol::S7
        );
        assert_eq!(
            manager.pool(Protocol::ModbusTcp).protocol(),
            Protocol::ModbusTcp
        );
    }

    #[tokio::test]
    async fn scripted_reads_come_back_good() {
        let pool = ConnectionPool::with_factory(
            Protocol::ModbusTcp,
            settings(),
            breaker(),
            Box::new(|device| {
                Ok(Box::new(ScriptedClient::new(
                    &device.id,
                    vec![Ok(RawReading::new(Value::Int(42)))],
                )) as Box<dyn ProtocolClient>)
            }),
        );
        let dev = device("plc-001");
        let points = pool.read_tags(&dev, &dev.tags).await.unwrap();
        assert_eq!(points.len(), 1);
        assert!(points[0].quality.is_good());
        assert_eq!(points[0].value, Value::Int(42));
    }
}
