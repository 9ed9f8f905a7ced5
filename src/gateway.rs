//! Gateway orchestrator: wires the broker session, pools, scheduler,
//! command handler and config listener together, and owns the shutdown
//! sequence.

use crate::commands::CommandHandler;
use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::model::{ConfigEvent, Device};
use crate::mqtt::publisher::MqttPublisher;
use crate::mqtt::{CMD_RESPONSE_PREFIX, CMD_SET_FILTER, CMD_WRITE_FILTER, CONFIG_FILTER};
use crate::pool::PoolManager;
use crate::registry::{ConfigChange, DeviceRegistry};
use crate::retry::RetryPolicy;
use crate::scheduler::PollScheduler;
use rumqttc::{Publish, QoS};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<DeviceRegistry>,
    pools: Arc<PoolManager>,
    publisher: Arc<MqttPublisher>,
    scheduler: Arc<PollScheduler>,
    cancel: CancellationToken,
}

impl Gateway {
    /// Bring up every subsystem in dependency order and start polling.
    pub async fn start(
        config: GatewayConfig,
        devices: Vec<Device>,
        cancel: CancellationToken,
    ) -> GatewayResult<Arc<Self>> {
        let (incoming_tx, incoming_rx) = mpsc::channel::<Publish>(1024);
        let publisher = MqttPublisher::start(&config.mqtt, Some(incoming_tx), cancel.clone())?;
        publisher.subscribe(CMD_WRITE_FILTER, QoS::AtLeastOnce).await?;
        publisher.subscribe(CMD_SET_FILTER, QoS::AtLeastOnce).await?;
        publisher.subscribe(CONFIG_FILTER, QoS::AtLeastOnce).await?;

        let retry_policy = RetryPolicy {
            max_attempts: config.read_retries,
            ..Default::default()
        };
        let pools = Arc::new(PoolManager::new(
            config.pool.clone(),
            config.breaker.to_breaker_config(),
            retry_policy,
        ));
        pools.spawn_maintenance(&cancel);

        let registry = Arc::new(DeviceRegistry::new());
        registry.load(devices).await;

        let scheduler = Arc::new(PollScheduler::new(
            pools.clone(),
            publisher.clone(),
            config.worker_count,
            cancel.clone(),
        ));
        for device in registry.all().await {
            scheduler.register(device).await;
        }
        scheduler.start().await;

        let commands = CommandHandler::new(
            registry.clone(),
            pools.clone(),
            publisher.clone(),
            config.write_timeout(),
            config.max_concurrent_writes,
        );

        let gateway = Arc::new(Gateway {
            config,
            registry,
            pools,
            publisher,
            scheduler,
            cancel: cancel.clone(),
        });

        tokio::spawn(route_incoming(
            incoming_rx,
            commands,
            gateway.clone(),
            cancel,
        ));

        info!("gateway started");
        Ok(gateway)
    }

    /// Apply one config notification: update the registry, then converge
    /// pollers and pooled connections on the new state.
    async fn apply_config_event(&self, publish: &Publish) {
        let event: ConfigEvent = match serde_json::from_slice(&publish.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(topic = %publish.topic, error = %e, "malformed config event");
                return;
            }
        };

        match self.registry.apply_event(&publish.topic, event).await {
            Ok(ConfigChange::DeviceUpserted(device))
            | Ok(ConfigChange::DeviceReloaded(device)) => {
                // Drop any stale connection so the next poll redials with
                // the new parameters.
                self.pools.remove_device(&device).await;
                self.scheduler.register(device).await;
            }
            Ok(ConfigChange::DeviceRemoved(device)) => {
                self.scheduler.unregister(&device.id).await;
                self.pools.remove_device(&device).await;
            }
            Ok(ConfigChange::Noop) => {}
            Err(e) => {
                warn!(topic = %publish.topic, error = %e, "config event rejected");
            }
        }
    }

    /// Ordered shutdown: stop new polls, let in-flight ones finish inside
    /// the budget, then close device connections and the broker session.
    pub async fn shutdown(&self) {
        let budget = self.config.shutdown_timeout();
        info!(budget_secs = budget.as_secs(), "gateway shutting down");

        self.scheduler.stop().await;

        // In-flight polls hold worker permits; waiting for all of them
        // is the drain barrier.
        let drained = tokio::time::timeout(budget, self.scheduler.drain()).await;
        if drained.is_err() {
            warn!("shutdown budget exhausted while draining polls");
        }

        self.pools.close().await;
        self.publisher.shutdown().await;
        self.cancel.cancel();
        info!("gateway stopped");
    }

    pub fn is_broker_connected(&self) -> bool {
        self.publisher.is_connected()
    }

    pub async fn device_count(&self) -> usize {
        self.registry.len().await
    }

    /// Counter snapshot for the `/status` endpoint.
    pub async fn status(&self) -> serde_json::Value {
        let mut pools = Vec::new();
        for pool in self.pools.pools() {
            pools.push(json!({
                "protocol": pool.protocol().to_string(),
                "connections": pool.connection_count().await,
                "breaker": pool.breaker_state().as_str(),
            }));
        }
        json!({
            "environment": self.config.environment,
            "broker_connected": self.publisher.is_connected(),
            "publish_buffer": self.publisher.buffered(),
            "devices": self.scheduler.snapshots().await,
            "pools": pools,
        })
    }
}

/// Fan inbound publishes out to the command handler and the config
/// listener.
async fn route_incoming(
    mut incoming: mpsc::Receiver<Publish>,
    commands: Arc<CommandHandler>,
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
) {
    loop {
        let publish = tokio::select! {
            _ = cancel.cancelled() => break,
            received = incoming.recv() => match received {
                Some(publish) => publish,
                None => break,
            },
        };

        let topic = publish.topic.as_str();
        if topic.starts_with(CMD_RESPONSE_PREFIX) {
            // Our own responses echoed back by a loose subscription.
            continue;
        }
        if topic.starts_with("$nexus/cmd/") {
            commands.spawn_handle(publish);
        } else if topic.starts_with("$nexus/config/") {
            gateway.apply_config_event(&publish).await;
        } else {
            error!(topic = %topic, "unroutable inbound message");
        }
    }
}
