//! OPC UA client.
//!
//! Wraps an `opcua` session for one server. Session calls in the `opcua`
//! crate are synchronous, so every service invocation hops through
//! `spawn_blocking`. Parsed node ids are cached per client. Besides
//! polled reads, a [`SubscriptionManager`] can request server-side
//! monitored items with publish/sampling intervals and an optional
//! deadband filter, feeding notifications through the same normalization
//! path as polled points.

use super::{point_from_raw, ProtocolClient, RawReading};
use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{
    ConnectionParams, DataPoint, DataType, Protocol, Quality, Tag, Value,
};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use opcua::client::prelude::*;
use opcua::sync::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tracing::{debug, info, warn};

type SharedSession = Arc<RwLock<Session>>;

pub struct OpcUaClient {
    device_id: String,
    params: ConnectionParams,
    policy: RetryPolicy,
    session: Option<SharedSession>,
    node_cache: HashMap<String, NodeId>,
    /// Live subscriptions, recreated after a reconnect.
    subscriptions: Vec<Arc<SubscriptionManager>>,
}

impl OpcUaClient {
    pub fn new(
        device_id: String,
        params: ConnectionParams,
        policy: RetryPolicy,
    ) -> ProtocolResult<Self> {
        if !params.endpoint.starts_with("opc.tcp://") {
            return Err(ProtocolError::InvalidAddress(format!(
                "opc ua endpoint must be an opc.tcp:// url: {}",
                params.endpoint
            )));
        }
        Ok(OpcUaClient {
            device_id,
            params,
            policy,
            session: None,
            node_cache: HashMap::new(),
            subscriptions: Vec::new(),
        })
    }

    fn session(&self) -> ProtocolResult<SharedSession> {
        self.session.clone().ok_or(ProtocolError::NotConnected)
    }

    /// Parse a `ns=N;{i|s|g|b}=…` node id, caching the result.
    fn node_id(&mut self, address: &str) -> ProtocolResult<NodeId> {
        if let Some(cached) = self.node_cache.get(address) {
            return Ok(cached.clone());
        }
        let parsed = address.parse::<NodeId>().map_err(|_| {
            ProtocolError::InvalidAddress(format!("invalid node id: {}", address))
        })?;
        self.node_cache.insert(address.to_string(), parsed.clone());
        Ok(parsed)
    }

    fn identity_token(&self) -> IdentityToken {
        if let (Some(cert), Some(key)) = (&self.params.cert_path, &self.params.key_path) {
            return IdentityToken::X509(PathBuf::from(cert), PathBuf::from(key));
        }
        if let (Some(user), Some(pass)) = (&self.params.username, &self.params.password) {
            return IdentityToken::UserName(user.clone(), pass.clone());
        }
        IdentityToken::Anonymous
    }

    fn security_mode(&self) -> MessageSecurityMode {
        match self.params.security_mode.as_deref() {
            Some("Sign") => MessageSecurityMode::Sign,
            Some("SignAndEncrypt") => MessageSecurityMode::SignAndEncrypt,
            _ => MessageSecurityMode::None,
        }
    }

    async fn read_data_value(&mut self, address: &str) -> ProtocolResult<DataValue> {
        let node_id = self.node_id(address)?;
        let session = self.session()?;
        let read_id = ReadValueId {
            node_id,
            attribute_id: AttributeId::Value as u32,
            index_range: UAString::null(),
            data_encoding: QualifiedName::null(),
        };
        let mut results = spawn_blocking(move || {
            let session = session.read();
            session.read(&[read_id], TimestampsToReturn::Both, 0.0)
        })
        .await
        .map_err(|e| ProtocolError::ReadFailed(e.to_string()))?
        .map_err(|status| status_error(status, "read"))?;

        if results.is_empty() {
            return Err(ProtocolError::ReadFailed("empty read response".into()));
        }
        Ok(results.remove(0))
    }
}

fn status_error(status: StatusCode, op: &str) -> ProtocolError {
    if status == StatusCode::BadUserAccessDenied || status == StatusCode::BadNotWritable {
        return ProtocolError::AccessDenied(format!("{:?}", status));
    }
    if status == StatusCode::BadSessionClosed || status == StatusCode::BadConnectionClosed {
        return ProtocolError::ConnectionClosed(format!("{:?}", status));
    }
    if status == StatusCode::BadTimeout || status == StatusCode::BadRequestTimeout {
        return ProtocolError::Timeout;
    }
    ProtocolError::OpcStatus(format!("{} failed with {:?}", op, status))
}

/// Map a data value's status to the uniform quality enum.
fn status_quality(status: Option<StatusCode>) -> Quality {
    match status {
        None => Quality::Good,
        Some(s) if s.is_good() => Quality::Good,
        Some(s) if s.is_bad() => Quality::Bad,
        Some(_) => Quality::Uncertain,
    }
}

fn variant_to_value(variant: Variant) -> Value {
    match variant {
        Variant::Boolean(b) => Value::Bool(b),
        Variant::SByte(v) => Value::Int(v as i64),
        Variant::Int16(v) => Value::Int(v as i64),
        Variant::Int32(v) => Value::Int(v as i64),
        Variant::Int64(v) => Value::Int(v),
        Variant::Byte(v) => Value::UInt(v as u64),
        Variant::UInt16(v) => Value::UInt(v as u64),
        Variant::UInt32(v) => Value::UInt(v as u64),
        Variant::UInt64(v) => Value::UInt(v),
        Variant::Float(v) => Value::Float(v as f64),
        Variant::Double(v) => Value::Float(v),
        Variant::String(s) => Value::Text(s.to_string()),
        other => Value::Text(format!("{:?}", other)),
    }
}

/// Build the variant a write sends, driven by the tag's declared type.
fn value_to_variant(value: &Value, data_type: DataType) -> ProtocolResult<Variant> {
    let mismatch = || {
        ProtocolError::InvalidDataType(format!(
            "cannot write {} value as {:?}",
            value.type_name(),
            data_type
        ))
    };
    Ok(match (data_type, value) {
        (DataType::Bool, Value::Bool(b)) => Variant::Boolean(*b),
        (DataType::Int16, Value::Int(v)) => Variant::Int16(*v as i16),
        (DataType::Int32, Value::Int(v)) => Variant::Int32(*v as i32),
        (DataType::Int64, Value::Int(v)) => Variant::Int64(*v),
        (DataType::UInt16, Value::UInt(v)) => Variant::UInt16(*v as u16),
        (DataType::UInt32, Value::UInt(v)) => Variant::UInt32(*v as u32),
        (DataType::UInt64, Value::UInt(v)) => Variant::UInt64(*v),
        (DataType::Float32, Value::Float(v)) => Variant::Float(*v as f32),
        (DataType::Float64, Value::Float(v)) => Variant::Double(*v),
        (DataType::String, Value::Text(s)) => Variant::String(UAString::from(s.as_str())),
        _ => return Err(mismatch()),
    })
}

fn data_value_to_raw(dv: DataValue) -> RawReading {
    let quality = status_quality(dv.status);
    let value = dv
        .value
        .map(variant_to_value)
        .unwrap_or(Value::Null);
    let source_ts = dv.source_timestamp.map(|ts| ts.as_chrono());
    RawReading {
        // Quality gating: a bad reading carries no usable value.
        value: if quality == Quality::Bad { Value::Null } else { value },
        quality,
        source_ts,
    }
}

#[async_trait]
impl ProtocolClient for OpcUaClient {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn protocol(&self) -> Protocol {
        Protocol::OpcUa
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn connect(&mut self) -> ProtocolResult<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let endpoint_url = self.params.endpoint.clone();
        let security_policy = self
            .params
            .security_policy
            .clone()
            .unwrap_or_else(|| "None".to_string());
        let security_mode = self.security_mode();
        let identity = self.identity_token();
        let device_id = self.device_id.clone();

        let connect = spawn_blocking(move || -> Result<SharedSession, String> {
            let mut client = ClientBuilder::new()
                .application_name("Nexus Protocol Gateway")
                .application_uri("urn:nexus:gateway")
                .pki_dir("./pki")
                .create_sample_keypair(true)
                .trust_server_certs(true)
                .session_retry_limit(3)
                .client()
                .ok_or_else(|| "failed to build opc ua client".to_string())?;

            let endpoint: EndpointDescription = (
                endpoint_url.as_str(),
                security_policy.as_str(),
                security_mode,
                UserTokenPolicy::anonymous(),
            )
                .into();

            let session = client
                .connect_to_endpoint(endpoint, identity)
                .map_err(|status| format!("{:?}", status))?;

            // The session run loop drives keep-alives and publish
            // responses until disconnect ends it.
            let runner = session.clone();
            std::thread::spawn(move || {
                Session::run(runner);
            });

            debug!(device = %device_id, "opc ua session established");
            Ok(session)
        });

        let session = timeout(self.params.connect_timeout(), connect)
            .await
            .map_err(|_| {
                ProtocolError::ConnectionTimeout(format!(
                    "connect to {} timed out",
                    self.params.endpoint
                ))
            })?
            .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?
            .map_err(ProtocolError::ConnectionFailed)?;

        self.session = Some(session.clone());
        info!(device = %self.device_id, endpoint = %self.params.endpoint, "opc ua connected");

        // Recreate any subscriptions that existed before a session loss.
        for manager in &self.subscriptions {
            if let Err(e) = manager.recreate_on(session.clone()).await {
                warn!(
                    device = %self.device_id,
                    error = %e,
                    "failed to recreate subscription on new session"
                );
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> ProtocolResult<()> {
        if let Some(session) = self.session.take() {
            let _ = spawn_blocking(move || {
                session.read().disconnect();
            })
            .await;
            debug!(device = %self.device_id, "opc ua disconnected");
        }
        Ok(())
    }

    /// Reads the server state variable (ns=0;i=2259), present on every
    /// conforming server.
    async fn probe(&mut self) -> ProtocolResult<()> {
        self.read_data_value("i=2259").await.map(|_| ())
    }

    async fn read_value(&mut self, tag: &Tag) -> ProtocolResult<RawReading> {
        let dv = self.read_data_value(&tag.address).await?;
        Ok(data_value_to_raw(dv))
    }

    /// Batch read: all node ids in one Read service call.
    async fn read_tags(&mut self, tags: &[Tag]) -> Vec<DataPoint> {
        let mut read_ids = Vec::with_capacity(tags.len());
        let mut planned: Vec<Option<ProtocolError>> = Vec::with_capacity(tags.len());
        for tag in tags {
            match self.node_id(&tag.address) {
                Ok(node_id) => {
                    read_ids.push(ReadValueId {
                        node_id,
                        attribute_id: AttributeId::Value as u32,
                        index_range: UAString::null(),
                        data_encoding: QualifiedName::null(),
                    });
                    planned.push(None);
                }
                Err(e) => planned.push(Some(e)),
            }
        }

        let session = match self.session() {
            Ok(s) => s,
            Err(e) => {
                let quality = e.quality();
                return tags
                    .iter()
                    .map(|t| DataPoint::failed(&self.device_id, t, quality))
                    .collect();
            }
        };

        let response = spawn_blocking(move || {
            let session = session.read();
            session.read(&read_ids, TimestampsToReturn::Both, 0.0)
        })
        .await
        .map_err(|e| ProtocolError::ReadFailed(e.to_string()))
        .and_then(|r| r.map_err(|status| status_error(status, "read")));

        match response {
            Ok(data_values) => {
                let mut dvs = data_values.into_iter();
                tags.iter()
                    .zip(planned)
                    .map(|(tag, plan_err)| match plan_err {
                        Some(e) => DataPoint::failed(&self.device_id, tag, e.quality()),
                        None => match dvs.next() {
                            Some(dv) => {
                                point_from_raw(&self.device_id, tag, data_value_to_raw(dv))
                            }
                            None => DataPoint::failed(&self.device_id, tag, Quality::Bad),
                        },
                    })
                    .collect()
            }
            Err(e) => {
                warn!(device = %self.device_id, error = %e, "batch read failed");
                let quality = e.quality();
                tags.iter()
                    .map(|t| DataPoint::failed(&self.device_id, t, quality))
                    .collect()
            }
        }
    }

    async fn write_value(&mut self, tag: &Tag, value: &Value) -> ProtocolResult<()> {
        let node_id = self.node_id(&tag.address)?;
        let variant = value_to_variant(value, tag.data_type)?;
        let session = self.session()?;

        let write_value = WriteValue {
            node_id,
            attribute_id: AttributeId::Value as u32,
            index_range: UAString::null(),
            value: DataValue::value_only(variant),
        };

        let results = spawn_blocking(move || {
            let session = session.read();
            session.write(&[write_value])
        })
        .await
        .map_err(|e| ProtocolError::WriteFailed(e.to_string()))?
        .map_err(|status| status_error(status, "write"))?;

        match results.first() {
            Some(status) if status.is_good() => Ok(()),
            Some(status) => Err(status_error(*status, "write")),
            None => Err(ProtocolError::WriteFailed("empty write response".into())),
        }
    }
}

/// Deadband filter applied server-side to monitored items.
#[derive(Debug, Clone, Copy)]
pub enum Deadband {
    Absolute(f64),
    Percent(f64),
}

/// Monitored-item settings for one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    pub publish_interval_ms: f64,
    pub sampling_interval_ms: f64,
    pub queue_size: u32,
    pub deadband: Option<Deadband>,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        SubscriptionSettings {
            publish_interval_ms: 500.0,
            sampling_interval_ms: 250.0,
            queue_size: 10,
            deadband: None,
        }
    }
}

fn deadband_filter(deadband: Option<Deadband>) -> ExtensionObject {
    match deadband {
        None => ExtensionObject::null(),
        Some(db) => {
            let (deadband_type, deadband_value) = match db {
                Deadband::Absolute(v) => (DeadbandType::Absolute, v),
                Deadband::Percent(v) => (DeadbandType::Percent, v),
            };
            let filter = DataChangeFilter {
                trigger: DataChangeTrigger::StatusValue,
                deadband_type: deadband_type as u32,
                deadband_value,
            };
            ExtensionObject::from_encodable(
                ObjectId::DataChangeFilter_Encoding_DefaultBinary,
                &filter,
            )
        }
    }
}

/// Server-side change subscription as an alternative to polling.
///
/// Owns the client-handle → tag routing table. Data-change notifications
/// locate their tag by handle and emit normalized points on the channel
/// given at creation. The manager holds everything needed to recreate the
/// subscription on a fresh session after a reconnect.
pub struct SubscriptionManager {
    device_id: String,
    settings: SubscriptionSettings,
    tags_by_handle: Arc<HashMap<u32, Tag>>,
    tx: mpsc::UnboundedSender<DataPoint>,
    subscription_id: Mutex<Option<u32>>,
}

impl SubscriptionManager {
    /// Create the subscription on `session`, monitoring `tags`. Points
    /// flow out through `tx`.
    pub async fn create(
        device_id: String,
        session: SharedSession,
        tags: Vec<Tag>,
        settings: SubscriptionSettings,
        tx: mpsc::UnboundedSender<DataPoint>,
    ) -> ProtocolResult<Arc<Self>> {
        let mut tags_by_handle = HashMap::with_capacity(tags.len());
        for (i, tag) in tags.into_iter().enumerate() {
            tags_by_handle.insert(i as u32 + 1, tag);
        }

        let manager = Arc::new(SubscriptionManager {
            device_id,
            settings,
            tags_by_handle: Arc::new(tags_by_handle),
            tx,
            subscription_id: Mutex::new(None),
        });
        manager.recreate_on(session).await?;
        Ok(manager)
    }

    /// (Re)create the server-side subscription and its monitored items.
    pub async fn recreate_on(&self, session: SharedSession) -> ProtocolResult<()> {
        let device_id = self.device_id.clone();
        let settings = self.settings.clone();
        let tags_by_handle = self.tags_by_handle.clone();
        let tx = self.tx.clone();

        let callback_tags = tags_by_handle.clone();
        let callback_device = device_id.clone();

        let subscription_id = spawn_blocking(move || -> Result<u32, StatusCode> {
            let session = session.read();

            let subscription_id = session.create_subscription(
                settings.publish_interval_ms,
                10,
                30,
                0,
                0,
                true,
                DataChangeCallback::new(move |changed_items| {
                    for item in changed_items.iter() {
                        let handle = item.client_handle();
                        let Some(tag) = callback_tags.get(&handle) else {
                            continue;
                        };
                        let point = point_from_raw(
                            &callback_device,
                            tag,
                            data_value_to_raw(item.last_value().clone()),
                        );
                        if tx.send(point).is_err() {
                            // Receiver gone; the gateway is shutting down.
                            return;
                        }
                    }
                }),
            )?;

            let mut items = Vec::with_capacity(tags_by_handle.len());
            for (handle, tag) in tags_by_handle.iter() {
                let node_id = match tag.address.parse::<NodeId>() {
                    Ok(id) => id,
                    Err(_) => continue,
                };
                items.push(MonitoredItemCreateRequest {
                    item_to_monitor: node_id.into(),
                    monitoring_mode: MonitoringMode::Reporting,
                    requested_parameters: MonitoringParameters {
                        client_handle: *handle,
                        sampling_interval: settings.sampling_interval_ms,
                        filter: deadband_filter(settings.deadband),
                        queue_size: settings.queue_size,
                        discard_oldest: true,
                    },
                });
            }
            session.create_monitored_items(
                subscription_id,
                TimestampsToReturn::Both,
                &items,
            )?;

            Ok(subscription_id)
        })
        .await
        .map_err(|e| ProtocolError::ReadFailed(e.to_string()))?
        .map_err(|status| status_error(status, "create subscription"))?;

        info!(
            device = %self.device_id,
            subscription_id = subscription_id,
            tags = self.tags_by_handle.len(),
            "opc ua subscription created"
        );
        *self.subscription_id.lock().unwrap() = Some(subscription_id);
        Ok(())
    }

    pub fn subscription_id(&self) -> Option<u32> {
        *self.subscription_id.lock().unwrap()
    }
}

impl OpcUaClient {
    /// Monitor `tags` server-side instead of polling them. The returned
    /// manager is retained so the subscription survives reconnects.
    pub async fn subscribe_tags(
        &mut self,
        tags: Vec<Tag>,
        settings: SubscriptionSettings,
        tx: mpsc::UnboundedSender<DataPoint>,
    ) -> ProtocolResult<Arc<SubscriptionManager>> {
        let session = self.session()?;
        let manager = SubscriptionManager::create(
            self.device_id.clone(),
            session,
            tags,
            settings,
            tx,
        )
        .await?;
        self.subscriptions.push(manager.clone());
        Ok(manager)
    }
}
