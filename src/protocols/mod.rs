//! Protocol client layer.
//!
//! Each field protocol implements [`ProtocolClient`] for one device. The
//! trait carries default implementations of the read/write paths (retry
//! with exponential backoff, a single in-line reconnect after connection
//! errors, engineering scaling, quality annotation) so the concrete
//! clients only provide the wire primitives. Clients are protocol-specific
//! but device-scoped: one instance owns one transport.

use crate::codec;
use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{DataPoint, Device, Protocol, Quality, Tag, Value};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

pub mod modbus;
pub mod opcua;
pub mod s7;

/// Unscaled value straight off the wire, plus the device timestamp and
/// quality when the protocol carries them (OPC UA does; Modbus and S7
/// readings are Good by construction or fail outright).
#[derive(Debug, Clone)]
pub struct RawReading {
    pub value: Value,
    pub quality: Quality,
    pub source_ts: Option<DateTime<Utc>>,
}

impl RawReading {
    pub fn new(value: Value) -> Self {
        RawReading {
            value,
            quality: Quality::Good,
            source_ts: None,
        }
    }
}

/// One device's protocol transport.
///
/// `read_value`/`write_value` are single wire exchanges with no retry;
/// the provided `read_tag`/`read_tags`/`write_tag` wrap them with the
/// uniform failure policy.
#[async_trait]
pub trait ProtocolClient: Send {
    fn device_id(&self) -> &str;

    fn protocol(&self) -> Protocol;

    fn retry_policy(&self) -> &RetryPolicy;

    fn is_connected(&self) -> bool;

    /// Establish the transport. Idempotent when already connected.
    async fn connect(&mut self) -> ProtocolResult<()>;

    /// Release the transport. Idempotent.
    async fn disconnect(&mut self) -> ProtocolResult<()>;

    /// Cheap liveness probe used by the pool's health-check loop.
    async fn probe(&mut self) -> ProtocolResult<()>;

    /// One protocol-specific read, no retries, value unscaled.
    async fn read_value(&mut self, tag: &Tag) -> ProtocolResult<RawReading>;

    /// One protocol-specific write of an already-coerced raw value.
    async fn write_value(&mut self, tag: &Tag, value: &Value) -> ProtocolResult<()>;

    /// Read one tag with retries. Never fails: exhausted retries yield a
    /// quality-annotated point instead.
    async fn read_tag(&mut self, tag: &Tag) -> DataPoint {
        let policy = self.retry_policy().clone();
        let mut last_err: Option<ProtocolError> = None;

        for attempt in 0..=policy.max_attempts {
            if attempt > 0 {
                policy.backoff(attempt - 1).await;
            }
            if !self.is_connected() {
                if let Err(e) = self.connect().await {
                    debug!(
                        device = self.device_id(),
                        tag = %tag.id,
                        attempt = attempt,
                        error = %e,
                        "connect before read failed"
                    );
                    last_err = Some(e);
                    continue;
                }
            }
            match self.read_value(tag).await {
                Ok(raw) => return point_from_raw(self.device_id(), tag, raw),
                Err(e) if e.is_retryable() => {
                    if e.is_connection_error() {
                        self.reconnect_once().await;
                    }
                    last_err = Some(e);
                }
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }

        let err = last_err.unwrap_or(ProtocolError::NotConnected);
        warn!(
            device = self.device_id(),
            tag = %tag.id,
            error = %err,
            "read exhausted retries"
        );
        DataPoint::failed(self.device_id(), tag, err.quality())
    }

    /// Read many tags. Default implementation reads tag-by-tag; protocols
    /// with batched read primitives override it. A failed tag never
    /// aborts the others.
    async fn read_tags(&mut self, tags: &[Tag]) -> Vec<DataPoint> {
        let mut points = Vec::with_capacity(tags.len());
        for tag in tags {
            points.push(self.read_tag(tag).await);
        }
        points
    }

    /// Write one tag with the same retry/reconnect policy as reads.
    /// Validates writability and reverse-scales before touching the wire.
    async fn write_tag(&mut self, tag: &Tag, value: &Value) -> ProtocolResult<()> {
        if !tag.is_writable() {
            return Err(ProtocolError::WriteNotPermitted);
        }
        let raw = codec::reverse_scaling(tag, value)?;

        let policy = self.retry_policy().clone();
        let mut last_err: Option<ProtocolError> = None;

        for attempt in 0..=policy.max_attempts {
            if attempt > 0 {
                policy.backoff(attempt - 1).await;
            }
            if !self.is_connected() {
                if let Err(e) = self.connect().await {
                    last_err = Some(e);
                    continue;
                }
            }
            match self.write_value(tag, &raw).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    if e.is_connection_error() {
                        self.reconnect_once().await;
                    }
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or(ProtocolError::NotConnected))
    }

    /// Single in-line reconnect between attempts after a connection
    /// error. Failure is tolerated here; the next attempt reports it.
    async fn reconnect_once(&mut self) {
        let _ = self.disconnect().await;
        if let Err(e) = self.connect().await {
            debug!(device = self.device_id(), error = %e, "in-line reconnect failed");
        }
    }
}

/// Build the published point for a successful read: scaling applied,
/// server timestamp stamped, wire quality carried over. The topic is
/// assigned by the scheduler, which knows the device's UNS prefix.
pub fn point_from_raw(device_id: &str, tag: &Tag, raw: RawReading) -> DataPoint {
    DataPoint {
        topic: String::new(),
        device_id: device_id.to_string(),
        tag_id: tag.id.clone(),
        value: codec::apply_scaling(tag, raw.value),
        quality: raw.quality,
        unit: tag.unit.clone(),
        source_ts: raw.source_ts,
        server_ts: Some(Utc::now()),
        received_at: None,
    }
}

/// Instantiate the client for a device's protocol.
pub fn create_client(
    device: &Device,
    policy: RetryPolicy,
) -> ProtocolResult<Box<dyn ProtocolClient>> {
    match device.protocol {
        Protocol::ModbusTcp | Protocol::ModbusRtu => Ok(Box::new(modbus::ModbusClient::new(
            device.id.clone(),
            device.protocol,
            device.connection.clone(),
            policy,
        )?)),
        Protocol::OpcUa => Ok(Box::new(opcua::OpcUaClient::new(
            device.id.clone(),
            device.connection.clone(),
            policy,
        )?)),
        Protocol::S7 => Ok(Box::new(s7::S7Client::new(
            device.id.clone(),
            device.connection.clone(),
            policy,
        )?)),
    }
}
