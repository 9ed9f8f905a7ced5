//! Device registry: the gateway's in-memory inventory.
//!
//! Read-mostly, so a single RW lock over an id-keyed map. Mutations come
//! from two producers: the YAML inventory at startup and
//! `$nexus/config/#` events afterwards. Config events are idempotent
//! upserts/deletes keyed by id; replaying one is harmless.

use crate::error::{GatewayError, GatewayResult};
use crate::model::{ConfigAction, ConfigEvent, Device, Tag};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<Device>>>,
}

/// What a config event did, so the gateway can adjust pollers and pools.
#[derive(Debug, Clone)]
pub enum ConfigChange {
    DeviceUpserted(Arc<Device>),
    DeviceRemoved(Arc<Device>),
    /// A tag changed under an existing device; the device was reloaded.
    DeviceReloaded(Arc<Device>),
    Noop,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(&self, devices: Vec<Device>) {
        let mut map = self.devices.write().await;
        for device in devices {
            map.insert(device.id.clone(), Arc::new(device));
        }
        info!(devices = map.len(), "device registry loaded");
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    pub async fn upsert(&self, device: Device) -> Arc<Device> {
        let device = Arc::new(device);
        self.devices
            .write()
            .await
            .insert(device.id.clone(), device.clone());
        device
    }

    pub async fn remove(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.write().await.remove(device_id)
    }

    /// Replace or add one tag on a device, returning the reloaded device.
    pub async fn upsert_tag(&self, device_id: &str, tag: Tag) -> GatewayResult<Arc<Device>> {
        let mut map = self.devices.write().await;
        let current = map
            .get(device_id)
            .ok_or_else(|| GatewayError::UnknownDevice(device_id.to_string()))?;

        let mut device = (**current).clone();
        match device.tags.iter_mut().find(|t| t.id == tag.id) {
            Some(slot) => *slot = tag,
            None => device.tags.push(tag),
        }
        let device = Arc::new(device);
        map.insert(device_id.to_string(), device.clone());
        Ok(device)
    }

    /// Drop one tag from a device. Removing an absent tag is a no-op.
    pub async fn remove_tag(&self, device_id: &str, tag_id: &str) -> GatewayResult<Arc<Device>> {
        let mut map = self.devices.write().await;
        let current = map
            .get(device_id)
            .ok_or_else(|| GatewayError::UnknownDevice(device_id.to_string()))?;

        let mut device = (**current).clone();
        device.tags.retain(|t| t.id != tag_id);
        let device = Arc::new(device);
        map.insert(device_id.to_string(), device.clone());
        Ok(device)
    }

    /// Apply one `$nexus/config/...` notification.
    ///
    /// `topic` carries the entity and its id:
    /// `$nexus/config/devices/{id}` or `$nexus/config/tags/{dev}/{tag}`.
    pub async fn apply_event(
        &self,
        topic: &str,
        event: ConfigEvent,
    ) -> GatewayResult<ConfigChange> {
        let segments: Vec<&str> = topic.split('/').collect();
        match segments.as_slice() {
            ["$nexus", "config", "devices", device_id] => {
                self.apply_device_event(device_id, event).await
            }
            ["$nexus", "config", "tags", device_id, tag_id] => {
                self.apply_tag_event(device_id, tag_id, event).await
            }
            _ => Err(GatewayError::InvalidConfiguration(format!(
                "unrecognized config topic: {}",
                topic
            ))),
        }
    }

    async fn apply_device_event(
        &self,
        device_id: &str,
        event: ConfigEvent,
    ) -> GatewayResult<ConfigChange> {
        match event.action {
            ConfigAction::Create | ConfigAction::Update => {
                let device: Device = serde_json::from_value(event.data).map_err(|e| {
                    GatewayError::InvalidConfiguration(format!(
                        "malformed device payload for {}: {}",
                        device_id, e
                    ))
                })?;
                if device.id != device_id {
                    return Err(GatewayError::InvalidConfiguration(format!(
                        "device id {} does not match topic id {}",
                        device.id, device_id
                    )));
                }
                info!(device = device_id, "config event: device upserted");
                Ok(ConfigChange::DeviceUpserted(self.upsert(device).await))
            }
            ConfigAction::Delete => match self.remove(device_id).await {
                Some(device) => {
                    info!(device = device_id, "config event: device removed");
                    Ok(ConfigChange::DeviceRemoved(device))
                }
                None => Ok(ConfigChange::Noop),
            },
        }
    }

    async fn apply_tag_event(
        &self,
        device_id: &str,
        tag_id: &str,
        event: ConfigEvent,
    ) -> GatewayResult<ConfigChange> {
        match event.action {
            ConfigAction::Create | ConfigAction::Update => {
                let tag: Tag = serde_json::from_value(event.data).map_err(|e| {
                    GatewayError::InvalidConfiguration(format!(
                        "malformed tag payload for {}/{}: {}",
                        device_id, tag_id, e
                    ))
                })?;
                if tag.id != tag_id {
                    return Err(GatewayError::InvalidConfiguration(format!(
                        "tag id {} does not match topic id {}",
                        tag.id, tag_id
                    )));
                }
                let device = self.upsert_tag(device_id, tag).await?;
                info!(device = device_id, tag = tag_id, "config event: tag upserted");
                Ok(ConfigChange::DeviceReloaded(device))
            }
            ConfigAction::Delete => {
                match self.remove_tag(device_id, tag_id).await {
                    Ok(device) => {
                        info!(device = device_id, tag = tag_id, "config event: tag removed");
                        Ok(ConfigChange::DeviceReloaded(device))
                    }
                    Err(GatewayError::UnknownDevice(_)) => {
                        warn!(
                            device = device_id,
                            tag = tag_id,
                            "tag delete for unknown device ignored"
                        );
                        Ok(ConfigChange::Noop)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectionParams, DataType, Protocol};
    use serde_json::json;

    fn device_json(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "protocol": "modbus-tcp",
            "connection": { "endpoint": "10.0.0.9:502", "unit_id": 2 },
            "poll_interval_ms": 500,
            "uns_prefix": format!("acme/site1/{}", id),
            "tags": [{
                "id": "temperature",
                "address": "40001",
                "data_type": "float32",
                "topic_suffix": "temperature"
            }]
        })
    }

    fn sample_device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            name: String::new(),
            protocol: Protocol::ModbusTcp,
            connection: ConnectionParams {
                endpoint: "10.0.0.9:502".into(),
                unit_id: Some(2),
                baud_rate: None,
                rack: None,
                slot: None,
                security_policy: None,
                security_mode: None,
                username: None,
                password: None,
                cert_path: None,
                key_path: None,
                connect_timeout_ms: 5000,
            },
            poll_interval_ms: 500,
            uns_prefix: format!("acme/site1/{}", id),
            enabled: true,
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn load_and_lookup() {
        let registry = DeviceRegistry::new();
        registry.load(vec![sample_device("plc-001")]).await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.get("plc-001").await.is_some());
        assert!(registry.get("plc-404").await.is_none());
    }

    #[tokio::test]
    async fn device_create_event_is_idempotent() {
        let registry = DeviceRegistry::new();
        let event = ConfigEvent {
            action: ConfigAction::Create,
            timestamp: None,
            data: device_json("plc-002"),
        };
        let change = registry
            .apply_event("$nexus/config/devices/plc-002", event)
            .await
            .unwrap();
        assert!(matches!(change, ConfigChange::DeviceUpserted(_)));
        assert_eq!(registry.len().await, 1);

        // Replaying the same event converges to the same state.
        let event = ConfigEvent {
            action: ConfigAction::Update,
            timestamp: None,
            data: device_json("plc-002"),
        };
        registry
            .apply_event("$nexus/config/devices/plc-002", event)
            .await
            .unwrap();
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn device_delete_event() {
        let registry = DeviceRegistry::new();
        registry.load(vec![sample_device("plc-003")]).await;

        let event = ConfigEvent {
            action: ConfigAction::Delete,
            timestamp: None,
            data: serde_json::Value::Null,
        };
        let change = registry
            .apply_event("$nexus/config/devices/plc-003", event)
            .await
            .unwrap();
        assert!(matches!(change, ConfigChange::DeviceRemoved(_)));
        assert!(registry.is_empty().await);

        // Deleting again is a no-op, not an error.
        let event = ConfigEvent {
            action: ConfigAction::Delete,
            timestamp: None,
            data: serde_json::Value::Null,
        };
        let change = registry
            .apply_event("$nexus/config/devices/plc-003", event)
            .await
            .unwrap();
        assert!(matches!(change, ConfigChange::Noop));
    }

    #[tokio::test]
    async fn tag_events_reload_their_device() {
        let registry = DeviceRegistry::new();
        registry.load(vec![sample_device("plc-004")]).await;

        let event = ConfigEvent {
            action: ConfigAction::Create,
            timestamp: None,
            data: json!({
                "id": "pressure",
                "address": "40010",
                "data_type": "uint16",
                "topic_suffix": "pressure",
                "unit": "bar"
            }),
        };
        let change = registry
            .apply_event("$nexus/config/tags/plc-004/pressure", event)
            .await
            .unwrap();
        let ConfigChange::DeviceReloaded(device) = change else {
            panic!("expected a reload");
        };
        assert_eq!(device.tags.len(), 1);
        assert_eq!(device.tags[0].data_type, DataType::UInt16);

        let event = ConfigEvent {
            action: ConfigAction::Delete,
            timestamp: None,
            data: serde_json::Value::Null,
        };
        let change = registry
            .apply_event("$nexus/config/tags/plc-004/pressure", event)
            .await
            .unwrap();
        let ConfigChange::DeviceReloaded(device) = change else {
            panic!("expected a reload");
        };
        assert!(device.tags.is_empty());
    }

    #[tokio::test]
    async fn mismatched_ids_are_rejected() {
        let registry = DeviceRegistry::new();
        let event = ConfigEvent {
            action: ConfigAction::Create,
            timestamp: None,
            data: device_json("plc-b"),
        };
        assert!(registry
            .apply_event("$nexus/config/devices/plc-a", event)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unknown_topic_shape_is_rejected() {
        let registry = DeviceRegistry::new();
        let event = ConfigEvent {
            action: ConfigAction::Create,
            timestamp: None,
            data: serde_json::Value::Null,
        };
        assert!(registry
            .apply_event("$nexus/config/what/is/this/even", event)
            .await
            .is_err());
    }
}
