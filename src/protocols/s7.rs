//! Siemens S7 client speaking ISO-on-TCP (RFC 1006) with the S7comm
//! read/write-var services.
//!
//! The connection handshake is COTP connection request/confirm with TSAPs
//! derived from rack and slot, followed by an S7 setup-communication
//! exchange that negotiates the PDU size. Addresses use the classic
//! `{Area}{Width}{Offset}[.Bit]` grammar over the DB, I, Q and M areas
//! (`DB5.DBW10`, `DB1.DBX0.3`, `IW2`, `M0.5`). S7-1200/1500 targets must
//! have PUT/GET enabled server-side for writes to be accepted.

use super::{ProtocolClient, RawReading};
use crate::codec;
use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{ConnectionParams, DataType, Protocol, Tag, Value};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

const TPKT_HEADER_LEN: usize = 4;
const COTP_DT_HEADER: [u8; 3] = [0x02, 0xF0, 0x80];
/// PDU size we request during setup; the PLC may negotiate down.
const REQUESTED_PDU_SIZE: u16 = 960;

/// Memory area of an S7 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7Area {
    /// Data block, with its block number.
    DataBlock(u16),
    Input,
    Output,
    Merker,
}

impl S7Area {
    fn code(&self) -> u8 {
        match self {
            S7Area::DataBlock(_) => 0x84,
            S7Area::Input => 0x81,
            S7Area::Output => 0x82,
            S7Area::Merker => 0x83,
        }
    }

    fn db_number(&self) -> u16 {
        match self {
            S7Area::DataBlock(n) => *n,
            _ => 0,
        }
    }
}

/// Access width of an S7 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7Width {
    /// Single bit (`X`, or a bare bit address like `M0.5`).
    Bit,
    Byte,
    Word,
    DWord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S7Address {
    pub area: S7Area,
    pub width: S7Width,
    pub byte_offset: u16,
    pub bit: u8,
}

/// Parse the `{Area}{Width}{Offset}[.Bit]` grammar.
pub fn parse_s7_address(address: &str) -> ProtocolResult<S7Address> {
    let invalid = || ProtocolError::InvalidAddress(format!("invalid s7 address: {}", address));
    let upper = address.trim().to_ascii_uppercase();

    let (area, rest) = if let Some(rest) = upper.strip_prefix("DB") {
        // DB<n>.DB<W><offset>[.bit]
        let dot = rest.find('.').ok_or_else(invalid)?;
        let db_number: u16 = rest[..dot].parse().map_err(|_| invalid())?;
        let field = rest[dot + 1..].strip_prefix("DB").ok_or_else(invalid)?;
        (S7Area::DataBlock(db_number), field.to_string())
    } else if let Some(rest) = upper.strip_prefix('I') {
        (S7Area::Input, rest.to_string())
    } else if let Some(rest) = upper.strip_prefix('Q') {
        (S7Area::Output, rest.to_string())
    } else if let Some(rest) = upper.strip_prefix('M') {
        (S7Area::Merker, rest.to_string())
    } else {
        return Err(invalid());
    };

    let (width, rest) = match rest.chars().next() {
        Some('X') => (Some(S7Width::Bit), &rest[1..]),
        Some('B') => (Some(S7Width::Byte), &rest[1..]),
        Some('W') => (Some(S7Width::Word), &rest[1..]),
        Some('D') => (Some(S7Width::DWord), &rest[1..]),
        Some(c) if c.is_ascii_digit() => (None, rest.as_str()),
        _ => return Err(invalid()),
    };

    let (offset_str, bit) = match rest.split_once('.') {
        Some((off, bit)) => {
            let bit: u8 = bit.parse().map_err(|_| invalid())?;
            if bit > 7 {
                return Err(invalid());
            }
            (off, Some(bit))
        }
        None => (rest, None),
    };
    let byte_offset: u16 = offset_str.parse().map_err(|_| invalid())?;

    // A bare offset with a bit suffix (`M0.5`) is a bit access; a bare
    // offset without one is a byte access.
    let width = match (width, bit) {
        (Some(S7Width::Bit), Some(_)) => S7Width::Bit,
        (Some(S7Width::Bit), None) => return Err(invalid()),
        (Some(w), None) => w,
        (Some(_), Some(_)) => return Err(invalid()),
        (None, Some(_)) => S7Width::Bit,
        (None, None) => S7Width::Byte,
    };

    Ok(S7Address {
        area,
        width,
        byte_offset,
        bit: bit.unwrap_or(0),
    })
}

impl S7Address {
    fn byte_len(&self) -> usize {
        match self.width {
            S7Width::Bit | S7Width::Byte => 1,
            S7Width::Word => 2,
            S7Width::DWord => 4,
        }
    }
}

fn item_error(code: u8) -> ProtocolError {
    let message = match code {
        0x01 => "hardware fault",
        0x03 => "accessing the object not allowed",
        0x05 => "address out of range",
        0x06 => "data type not supported",
        0x07 => "data type inconsistent",
        0x0A => "object does not exist",
        _ => "unknown item error",
    };
    match code {
        0x03 => ProtocolError::AccessDenied(message.to_string()),
        0x05 | 0x0A => ProtocolError::InvalidAddress(message.to_string()),
        _ => ProtocolError::S7Error {
            code,
            message: message.to_string(),
        },
    }
}

/// S7 read-var request PDU for one item of `count` bytes (or one bit).
fn build_read_request(pdu_ref: u16, addr: &S7Address, count: u16) -> Vec<u8> {
    build_var_request(0x04, pdu_ref, addr, count, None)
}

/// S7 write-var request PDU carrying `data`.
fn build_write_request(pdu_ref: u16, addr: &S7Address, data: &[u8]) -> Vec<u8> {
    build_var_request(0x05, pdu_ref, addr, data.len() as u16, Some(data))
}

fn build_var_request(
    function: u8,
    pdu_ref: u16,
    addr: &S7Address,
    count: u16,
    data: Option<&[u8]>,
) -> Vec<u8> {
    let is_bit = addr.width == S7Width::Bit;
    let transport_size: u8 = if is_bit { 0x01 } else { 0x02 };
    let bit_address =
        (addr.byte_offset as u32) * 8 + if is_bit { addr.bit as u32 } else { 0 };

    let mut param = Vec::with_capacity(14);
    param.push(function);
    param.push(0x01); // item count
    param.extend_from_slice(&[0x12, 0x0A, 0x10]); // var spec, length, S7ANY
    param.push(transport_size);
    param.extend_from_slice(&count.to_be_bytes());
    param.extend_from_slice(&addr.area.db_number().to_be_bytes());
    param.push(addr.area.code());
    param.extend_from_slice(&bit_address.to_be_bytes()[1..]); // 3-byte address

    let mut body = Vec::new();
    if let Some(data) = data {
        body.push(0x00); // reserved
        if is_bit {
            body.push(0x03); // transport size: bit
            body.extend_from_slice(&(data.len() as u16).to_be_bytes());
        } else {
            body.push(0x04); // transport size: byte/word/dword, length in bits
            body.extend_from_slice(&((data.len() as u16) * 8).to_be_bytes());
        }
        body.extend_from_slice(data);
    }

    let mut pdu = Vec::with_capacity(10 + param.len() + body.len());
    pdu.push(0x32); // protocol id
    pdu.push(0x01); // ROSCTR: job
    pdu.extend_from_slice(&[0x00, 0x00]); // redundancy id
    pdu.extend_from_slice(&pdu_ref.to_be_bytes());
    pdu.extend_from_slice(&(param.len() as u16).to_be_bytes());
    pdu.extend_from_slice(&(body.len() as u16).to_be_bytes());
    pdu.extend_from_slice(&param);
    pdu.extend_from_slice(&body);
    pdu
}

fn build_setup_request(pdu_ref: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(18);
    pdu.push(0x32);
    pdu.push(0x01);
    pdu.extend_from_slice(&[0x00, 0x00]);
    pdu.extend_from_slice(&pdu_ref.to_be_bytes());
    pdu.extend_from_slice(&8u16.to_be_bytes()); // param length
    pdu.extend_from_slice(&0u16.to_be_bytes()); // data length
    pdu.push(0xF0); // setup communication
    pdu.push(0x00);
    pdu.extend_from_slice(&1u16.to_be_bytes()); // max AMQ caller
    pdu.extend_from_slice(&1u16.to_be_bytes()); // max AMQ callee
    pdu.extend_from_slice(&REQUESTED_PDU_SIZE.to_be_bytes());
    pdu
}

/// Strip the S7 ack-data header, surfacing header-level errors.
fn ack_payload(pdu: &[u8]) -> ProtocolResult<(&[u8], &[u8])> {
    if pdu.len() < 12 || pdu[0] != 0x32 {
        return Err(ProtocolError::ReadFailed("malformed s7 response".into()));
    }
    if pdu[1] != 0x03 {
        return Err(ProtocolError::ReadFailed(format!(
            "unexpected s7 rosctr 0x{:02x}",
            pdu[1]
        )));
    }
    let param_len = u16::from_be_bytes([pdu[6], pdu[7]]) as usize;
    let data_len = u16::from_be_bytes([pdu[8], pdu[9]]) as usize;
    let error_class = pdu[10];
    let error_code = pdu[11];
    if error_class != 0 || error_code != 0 {
        return Err(ProtocolError::S7Error {
            code: error_code,
            message: format!("header error class 0x{:02x}", error_class),
        });
    }
    let param_start = 12;
    let data_start = param_start + param_len;
    if pdu.len() < data_start + data_len {
        return Err(ProtocolError::InvalidDataLength {
            expected: data_start + data_len,
            actual: pdu.len(),
        });
    }
    Ok((
        &pdu[param_start..data_start],
        &pdu[data_start..data_start + data_len],
    ))
}

/// Extract the payload bytes of a single-item read response.
fn parse_read_response(pdu: &[u8], expected_len: usize) -> ProtocolResult<Vec<u8>> {
    let (param, data) = ack_payload(pdu)?;
    if param.first() != Some(&0x04) {
        return Err(ProtocolError::ReadFailed("not a read-var response".into()));
    }
    if data.len() < 4 {
        return Err(ProtocolError::ReadFailed("truncated read item".into()));
    }
    let return_code = data[0];
    if return_code != 0xFF {
        return Err(item_error(return_code));
    }
    let transport_size = data[1];
    let length_field = u16::from_be_bytes([data[2], data[3]]) as usize;
    // Transport sizes 0x03 (bit) and 0x04 (byte) carry the length in
    // bits; 0x09 carries it in bytes.
    let byte_len = match transport_size {
        0x03 => 1,
        0x04 => length_field / 8,
        _ => length_field,
    };
    let payload = data
        .get(4..4 + byte_len)
        .ok_or(ProtocolError::InvalidDataLength {
            expected: byte_len,
            actual: data.len().saturating_sub(4),
        })?;
    if byte_len < expected_len {
        return Err(ProtocolError::InvalidDataLength {
            expected: expected_len,
            actual: byte_len,
        });
    }
    Ok(payload.to_vec())
}

fn parse_write_response(pdu: &[u8]) -> ProtocolResult<()> {
    let (param, data) = ack_payload(pdu)?;
    if param.first() != Some(&0x05) {
        return Err(ProtocolError::WriteFailed("not a write-var response".into()));
    }
    match data.first() {
        Some(&0xFF) => Ok(()),
        Some(&code) => Err(item_error(code)),
        None => Err(ProtocolError::WriteFailed("empty write response".into())),
    }
}

/// Negotiated PDU size out of a setup-communication response.
fn parse_setup_response(pdu: &[u8]) -> ProtocolResult<u16> {
    let (param, _) = ack_payload(pdu)?;
    if param.len() < 8 || param[0] != 0xF0 {
        return Err(ProtocolError::ConnectionFailed(
            "malformed setup-communication response".into(),
        ));
    }
    Ok(u16::from_be_bytes([param[6], param[7]]))
}

/// COTP connection request with snap7-style TSAPs (PG connection,
/// remote TSAP encodes rack and slot).
fn build_cotp_connect(rack: u16, slot: u16) -> Vec<u8> {
    let remote_tsap = 0x0100u16 | ((rack as u16) << 5) | (slot as u16);
    let mut frame = vec![
        0x11, // COTP length indicator
        0xE0, // connection request
        0x00, 0x00, // destination reference
        0x00, 0x01, // source reference
        0x00, // class 0
        0xC0, 0x01, 0x0A, // TPDU size 1024
        0xC1, 0x02, 0x01, 0x00, // source TSAP
        0xC2, 0x02, // destination TSAP parameter
    ];
    frame.extend_from_slice(&remote_tsap.to_be_bytes());
    frame
}

fn wrap_tpkt(body: &[u8]) -> Vec<u8> {
    let total = (body.len() + TPKT_HEADER_LEN) as u16;
    let mut frame = Vec::with_capacity(total as usize);
    frame.extend_from_slice(&[0x03, 0x00]);
    frame.extend_from_slice(&total.to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

pub struct S7Client {
    device_id: String,
    params: ConnectionParams,
    policy: RetryPolicy,
    stream: Option<TcpStream>,
    pdu_size: u16,
    pdu_ref: u16,
}

impl S7Client {
    pub fn new(
        device_id: String,
        params: ConnectionParams,
        policy: RetryPolicy,
    ) -> ProtocolResult<Self> {
        Ok(S7Client {
            device_id,
            params,
            policy,
            stream: None,
            pdu_size: REQUESTED_PDU_SIZE,
            pdu_ref: 0,
        })
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    fn op_timeout(&self) -> Duration {
        self.params.connect_timeout()
    }

    /// Send one TPKT frame and read the next one back.
    async fn exchange(&mut self, body: &[u8]) -> ProtocolResult<Vec<u8>> {
        let deadline = self.op_timeout();
        let stream = self.stream.as_mut().ok_or(ProtocolError::NotConnected)?;
        let frame = wrap_tpkt(body);

        let io = async {
            stream.write_all(&frame).await?;

            let mut header = [0u8; TPKT_HEADER_LEN];
            stream.read_exact(&mut header).await?;
            let total = u16::from_be_bytes([header[2], header[3]]) as usize;
            if total < TPKT_HEADER_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "tpkt length shorter than its header",
                ));
            }
            let mut body = vec![0u8; total - TPKT_HEADER_LEN];
            stream.read_exact(&mut body).await?;
            Ok::<Vec<u8>, std::io::Error>(body)
        };

        timeout(deadline, io)
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .map_err(classify_io)
    }

    /// Send an S7 PDU inside a COTP data TPDU and strip the framing from
    /// the response.
    async fn s7_exchange(&mut self, pdu: &[u8]) -> ProtocolResult<Vec<u8>> {
        let mut body = Vec::with_capacity(COTP_DT_HEADER.len() + pdu.len());
        body.extend_from_slice(&COTP_DT_HEADER);
        body.extend_from_slice(pdu);

        let response = self.exchange(&body).await?;
        if response.len() < COTP_DT_HEADER.len() || response[1] != 0xF0 {
            return Err(ProtocolError::ReadFailed("malformed cotp response".into()));
        }
        Ok(response[COTP_DT_HEADER.len()..].to_vec())
    }

    fn plan(tag: &Tag) -> ProtocolResult<(S7Address, usize)> {
        let addr = parse_s7_address(&tag.address)?;
        let expected = match tag.data_type {
            DataType::Bool => {
                if addr.width != S7Width::Bit {
                    return Err(ProtocolError::InvalidDataType(format!(
                        "bool tag {} needs a bit address",
                        tag.id
                    )));
                }
                1
            }
            DataType::String => {
                return Err(ProtocolError::InvalidDataType(
                    "string tags are not supported over s7".into(),
                ))
            }
            dt => {
                let len = dt.byte_len().unwrap_or(0);
                if addr.width == S7Width::Bit {
                    return Err(ProtocolError::InvalidDataType(format!(
                        "{:?} tag {} cannot use a bit address",
                        dt, tag.id
                    )));
                }
                len
            }
        };
        Ok((addr, expected))
    }
}

fn classify_io(io: std::io::Error) -> ProtocolError {
    match io.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ProtocolError::Timeout,
        std::io::ErrorKind::ConnectionRefused => ProtocolError::ConnectionFailed(io.to_string()),
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::NotConnected => ProtocolError::ConnectionClosed(io.to_string()),
        _ => ProtocolError::Io(io),
    }
}

#[async_trait]
impl ProtocolClient for S7Client {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn protocol(&self) -> Protocol {
        Protocol::S7
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> ProtocolResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = timeout(
            self.params.connect_timeout(),
            TcpStream::connect(&self.params.endpoint),
        )
        .await
        .map_err(|_| {
            ProtocolError::ConnectionTimeout(format!(
                "connect to {} timed out",
                self.params.endpoint
            ))
        })?
        .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
        self.stream = Some(stream);

        // COTP connection request, expect a connection confirm.
        let rack = self.params.rack.unwrap_or(0);
        let slot = self.params.slot.unwrap_or(1);
        let cc = self.exchange(&build_cotp_connect(rack, slot)).await?;
        if cc.len() < 2 || cc[1] != 0xD0 {
            self.stream = None;
            return Err(ProtocolError::ConnectionFailed(
                "cotp connection refused".into(),
            ));
        }

        // Negotiate the PDU size.
        let pdu_ref = self.next_ref();
        let response = self.s7_exchange(&build_setup_request(pdu_ref)).await?;
        let negotiated = parse_setup_response(&response).map_err(|e| {
            self.stream = None;
            e
        })?;
        self.pdu_size = negotiated.min(REQUESTED_PDU_SIZE);

        info!(
            device = %self.device_id,
            endpoint = %self.params.endpoint,
            rack = rack,
            slot = slot,
            pdu_size = self.pdu_size,
            "s7 connected"
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> ProtocolResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(device = %self.device_id, "s7 disconnected");
        }
        Ok(())
    }

    /// Reads one flag byte; any well-formed answer, including an access
    /// error, proves the PLC is alive.
    async fn probe(&mut self) -> ProtocolResult<()> {
        let addr = S7Address {
            area: S7Area::Merker,
            width: S7Width::Byte,
            byte_offset: 0,
            bit: 0,
        };
        let pdu_ref = self.next_ref();
        let response = self.s7_exchange(&build_read_request(pdu_ref, &addr, 1)).await?;
        match parse_read_response(&response, 1) {
            Ok(_)
            | Err(ProtocolError::AccessDenied(_))
            | Err(ProtocolError::InvalidAddress(_))
            | Err(ProtocolError::S7Error { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn read_value(&mut self, tag: &Tag) -> ProtocolResult<RawReading> {
        let (addr, expected) = Self::plan(tag)?;
        let pdu_ref = self.next_ref();
        let request = build_read_request(pdu_ref, &addr, expected as u16);
        let response = self.s7_exchange(&request).await?;
        let payload = parse_read_response(&response, expected)?;

        let value = if tag.data_type == DataType::Bool {
            Value::Bool(payload[0] & 0x01 != 0)
        } else {
            codec::decode(&payload[..expected], tag.data_type, tag.byte_order)?
        };
        Ok(RawReading::new(value))
    }

    async fn write_value(&mut self, tag: &Tag, value: &Value) -> ProtocolResult<()> {
        let (addr, _) = Self::plan(tag)?;

        let data = if tag.data_type == DataType::Bool {
            let state = value.as_bool().ok_or_else(|| {
                ProtocolError::InvalidDataType("bit write needs a bool".into())
            })?;
            vec![u8::from(state)]
        } else {
            codec::encode(value, tag.data_type, tag.byte_order)?
        };

        let pdu_ref = self.next_ref();
        let request = build_write_request(pdu_ref, &addr, &data);
        let response = self.s7_exchange(&request).await?;
        parse_write_response(&response)
    }
}
