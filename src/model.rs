//! Core data model shared by the gateway and the ingestion pipeline.
//!
//! Everything that crosses a module boundary lives here: devices and their
//! tags, typed values, quality codes, datapoints, and the write
//! command/response pair. Protocol-specific connection parameters are kept
//! as a single struct with optional fields so YAML config and MQTT config
//! events deserialize into one shape regardless of protocol.

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Field protocols the gateway speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    ModbusTcp,
    ModbusRtu,
    OpcUa,
    S7,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::ModbusTcp => write!(f, "modbus-tcp"),
            Protocol::ModbusRtu => write!(f, "modbus-rtu"),
            Protocol::OpcUa => write!(f, "opc-ua"),
            Protocol::S7 => write!(f, "s7"),
        }
    }
}

/// Static data type of a tag. Drives every conversion between wire bytes
/// and [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
}

impl DataType {
    /// Width in bytes on the wire. Strings have no fixed width.
    pub fn byte_len(&self) -> Option<usize> {
        match self {
            DataType::Bool => Some(1),
            DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => Some(4),
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => Some(8),
            DataType::String => None,
        }
    }

    /// Number of 16-bit Modbus registers the type occupies.
    pub fn register_count(&self) -> Option<u16> {
        match self.byte_len() {
            Some(1) => Some(1),
            Some(n) => Some((n / 2) as u16),
            None => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::Bool | DataType::String)
    }
}

/// Byte permutation applied to multi-register values.
///
/// Named after the resulting layout of a 32-bit value whose big-endian
/// bytes are `A B C D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ByteOrder {
    /// `ABCD`: big-endian.
    #[default]
    BigEndian,
    /// `DCBA`: little-endian.
    LittleEndian,
    /// `BADC`: bytes swapped within each 16-bit word.
    WordSwap,
    /// `CDAB`: adjacent 16-bit words swapped.
    ByteSwap,
}

/// Modbus register class. Determines the function codes used for reads
/// and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegisterType {
    /// 1-bit read/write (FC01 read, FC05/15 write).
    Coil,
    /// 1-bit read-only (FC02).
    DiscreteInput,
    /// 16-bit read/write (FC03 read, FC06/16 write).
    Holding,
    /// 16-bit read-only (FC04).
    Input,
}

impl RegisterType {
    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Holding)
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::DiscreteInput)
    }
}

/// Tag access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AccessMode {
    #[default]
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "rw")]
    ReadWrite,
}

/// Trustworthiness of a reading. Numeric codes follow the OPC UA
/// convention where Good is 192.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    #[default]
    Good,
    Uncertain,
    Bad,
    Timeout,
    NotConnected,
}

impl Quality {
    pub fn code(&self) -> i16 {
        match self {
            Quality::Good => 192,
            Quality::Uncertain => 64,
            Quality::Bad => 0,
            Quality::Timeout => 8,
            Quality::NotConnected => 24,
        }
    }

    pub fn from_code(code: i16) -> Self {
        match code {
            192 => Quality::Good,
            64 => Quality::Uncertain,
            8 => Quality::Timeout,
            24 => Quality::NotConnected,
            _ => Quality::Bad,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "good",
            Quality::Uncertain => "uncertain",
            Quality::Bad => "bad",
            Quality::Timeout => "timeout",
            Quality::NotConnected => "notconnected",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "good" => Quality::Good,
            "uncertain" => Quality::Uncertain,
            "timeout" => Quality::Timeout,
            "notconnected" => Quality::NotConnected,
            _ => Quality::Bad,
        }
    }

    pub fn is_good(&self) -> bool {
        matches!(self, Quality::Good)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Quality {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Quality {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Quality::parse(&s))
    }
}

/// Typed measurement value. Replaces the dynamic typing of the wire
/// payloads with a closed union; conversions to and from raw bytes are
/// always driven by the owning tag's [`DataType`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view, when one exists. Bools map to 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(v) => Some(*v != 0),
            Value::UInt(v) => Some(*v != 0),
            Value::Float(v) => Some(*v != 0.0),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Text(_) => "string",
        }
    }

    pub fn from_json(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            _ => Value::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::UInt(v) => serializer.serialize_u64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        if raw.is_array() || raw.is_object() {
            return Err(de::Error::custom("expected a scalar value"));
        }
        Ok(Value::from_json(&raw))
    }
}

/// One readable/writable variable on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Protocol-specific address: Modbus register number, OPC UA node id,
    /// or S7 address string.
    pub address: String,
    pub data_type: DataType,
    /// Modbus only; other protocols ignore it.
    #[serde(default)]
    pub register_type: Option<RegisterType>,
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// Bit index for booleans packed into a register.
    #[serde(default)]
    pub bit: Option<u8>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub access: AccessMode,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Appended to the device UNS prefix to form the publish topic.
    pub topic_suffix: String,
    /// Absolute deadband: suppress publishes whose numeric change from the
    /// last published value is below this threshold.
    #[serde(default)]
    pub deadband: Option<f64>,
}

fn default_scale() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl Tag {
    pub fn is_writable(&self) -> bool {
        self.access == AccessMode::ReadWrite
    }

    /// Whether engineering scaling changes the raw value at all.
    pub fn has_scaling(&self) -> bool {
        self.scale != 1.0 || self.offset != 0.0
    }
}

/// Transport parameters for one device. One struct for all protocols;
/// fields that do not apply stay `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// `host:port` for Modbus TCP and S7, serial device path for Modbus
    /// RTU, `opc.tcp://` URL for OPC UA.
    pub endpoint: String,
    /// Modbus unit/slave id (1-247).
    #[serde(default)]
    pub unit_id: Option<u8>,
    /// Modbus RTU serial speed.
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// S7 rack/slot.
    #[serde(default)]
    pub rack: Option<u16>,
    #[serde(default)]
    pub slot: Option<u16>,
    /// OPC UA security policy name (None, Basic128Rsa15, Basic256,
    /// Basic256Sha256).
    #[serde(default)]
    pub security_policy: Option<String>,
    /// OPC UA message security mode (None, Sign, SignAndEncrypt).
    #[serde(default)]
    pub security_mode: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// OPC UA client certificate/key for certificate authentication.
    #[serde(default)]
    pub cert_path: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl ConnectionParams {
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_timeout_ms)
    }
}

/// One physical endpoint and its tag list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub protocol: Protocol,
    pub connection: ConnectionParams,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Root of the hierarchical topic tree this device publishes under,
    /// e.g. `acme/site1/line2/plc-001`.
    pub uns_prefix: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Device {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn enabled_tags(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter().filter(|t| t.enabled)
    }

    pub fn find_tag(&self, tag_id: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.id == tag_id)
    }

    pub fn topic_for(&self, tag: &Tag) -> String {
        format!("{}/{}", self.uns_prefix, tag.topic_suffix)
    }
}

/// One measurement on its way from a device to the broker, or from the
/// broker into the store.
#[derive(Debug, Clone, Default)]
pub struct DataPoint {
    pub topic: String,
    pub device_id: String,
    pub tag_id: String,
    pub value: Value,
    pub quality: Quality,
    pub unit: String,
    /// Timestamp reported by the device itself, when the protocol carries
    /// one (OPC UA source timestamp).
    pub source_ts: Option<DateTime<Utc>>,
    /// When the gateway produced the point.
    pub server_ts: Option<DateTime<Utc>>,
    /// When the ingestion pipeline received the message.
    pub received_at: Option<DateTime<Utc>>,
}

impl DataPoint {
    /// Quality-annotated point for a failed read. Value stays null so
    /// consumers that skip the quality check cannot mistake it for data.
    pub fn failed(device_id: &str, tag: &Tag, quality: Quality) -> Self {
        DataPoint {
            topic: String::new(),
            device_id: device_id.to_string(),
            tag_id: tag.id.clone(),
            value: Value::Null,
            quality,
            unit: tag.unit.clone(),
            source_ts: None,
            server_ts: Some(Utc::now()),
            received_at: None,
        }
    }

    /// Clear every field for object-pool reuse.
    pub fn reset(&mut self) {
        self.topic.clear();
        self.device_id.clear();
        self.tag_id.clear();
        self.value = Value::Null;
        self.quality = Quality::Good;
        self.unit.clear();
        self.source_ts = None;
        self.server_ts = None;
        self.received_at = None;
    }
}

/// Inbound tag write, decoded from a `$nexus/cmd` message.
#[derive(Debug, Clone, Deserialize)]
pub struct WriteCommand {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub device_id: String,
    pub tag_id: String,
    pub value: Value,
}

/// Outcome published on `$nexus/cmd/response/{device}/{tag}`.
#[derive(Debug, Clone, Serialize)]
pub struct WriteResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

impl WriteResponse {
    pub fn ok(request_id: Option<String>, duration_ms: u64) -> Self {
        WriteResponse {
            request_id,
            success: true,
            error: None,
            timestamp: Utc::now(),
            duration_ms,
        }
    }

    pub fn err(request_id: Option<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        WriteResponse {
            request_id,
            success: false,
            error: Some(error.into()),
            timestamp: Utc::now(),
            duration_ms,
        }
    }
}

/// Derived device status as reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Last poll succeeded.
    Online,
    /// Last poll failed.
    Error,
    /// Never polled.
    Unknown,
}

/// Configuration-change notification consumed from `$nexus/config/#`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigEvent {
    pub action: ConfigAction,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigAction {
    Create,
    Update,
    Delete,
}
