//! Error taxonomies for the gateway and the ingestion pipeline.
//!
//! Wire errors from field devices are normalized into [`ProtocolError`]
//! regardless of protocol, so retry and quality mapping logic is written
//! once. Logic errors (unknown device, unwritable tag, malformed command)
//! live in [`GatewayError`]; the ingestion side has its own
//! [`IngestError`].

use crate::model::Quality;
use thiserror::Error;

/// Uniform failure taxonomy across Modbus, OPC UA and S7.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection timed out: {0}")]
    ConnectionTimeout(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("not connected to device")]
    NotConnected,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid data type: {0}")]
    InvalidDataType(String),

    #[error("invalid data length: expected {expected} bytes, got {actual}")]
    InvalidDataLength { expected: usize, actual: usize },

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("tag is not writable")]
    WriteNotPermitted,

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("operation timed out")]
    Timeout,

    #[error("modbus exception {code} ({})", modbus_exception_name(.code))]
    ModbusException { code: u8 },

    #[error("opc ua status: {0}")]
    OpcStatus(String),

    #[error("s7 error 0x{code:02x}: {message}")]
    S7Error { code: u8, message: String },

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn modbus_exception_name(code: &u8) -> &'static str {
    match *code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown",
    }
}

impl ProtocolError {
    /// Transient failures worth retrying in place.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionFailed(_)
                | ProtocolError::ConnectionTimeout(_)
                | ProtocolError::ConnectionClosed(_)
                | ProtocolError::NotConnected
                | ProtocolError::Timeout
                | ProtocolError::ReadFailed(_)
                | ProtocolError::WriteFailed(_)
                | ProtocolError::Io(_)
        )
    }

    /// Failures that indicate a broken transport, warranting a reconnect
    /// before the next attempt.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionFailed(_)
                | ProtocolError::ConnectionTimeout(_)
                | ProtocolError::ConnectionClosed(_)
                | ProtocolError::NotConnected
                | ProtocolError::Io(_)
        )
    }

    /// Configuration or validation faults that no amount of retrying can
    /// fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidAddress(_)
                | ProtocolError::InvalidDataType(_)
                | ProtocolError::WriteNotPermitted
                | ProtocolError::AccessDenied(_)
        )
    }

    /// Quality class a failed read collapses to once retries are
    /// exhausted.
    pub fn quality(&self) -> Quality {
        match self {
            ProtocolError::Timeout | ProtocolError::ConnectionTimeout(_) => Quality::Timeout,
            e if e.is_connection_error() => Quality::NotConnected,
            _ => Quality::Bad,
        }
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Gateway-level errors: validation and orchestration faults that are not
/// tied to a single wire exchange.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("unknown tag: {0}")]
    UnknownTag(String),

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("mqtt error: {0}")]
    Mqtt(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Ingestion-pipeline errors.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("mqtt error: {0}")]
    Mqtt(String),

    #[error("pipeline is shutting down")]
    Shutdown,
}

impl IngestError {
    /// Database outages are retried; everything else drops the batch.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            IngestError::Mqtt(_) => true,
            _ => false,
        }
    }
}

pub type IngestResult<T> = Result<T, IngestError>;
