//! Modbus TCP/RTU client.
//!
//! Register classes map to function codes the classic way: coils FC01/05,
//! discrete inputs FC02, holding registers FC03/06/16, input registers
//! FC04. Reads group tags by register class and merge contiguous address
//! ranges into single wire reads, capped at the protocol limits (120
//! registers, 2000 bits per request).

use super::{point_from_raw, ProtocolClient, RawReading};
use crate::codec;
use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{
    ConnectionParams, DataPoint, DataType, Protocol, RegisterType, Tag, Value,
};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

/// Protocol limits for one merged read request.
const MAX_REGISTERS_PER_READ: u16 = 120;
const MAX_BITS_PER_READ: u16 = 2000;

pub struct ModbusClient {
    device_id: String,
    protocol: Protocol,
    params: ConnectionParams,
    policy: RetryPolicy,
    ctx: Option<client::Context>,
}

impl ModbusClient {
    pub fn new(
        device_id: String,
        protocol: Protocol,
        params: ConnectionParams,
        policy: RetryPolicy,
    ) -> ProtocolResult<Self> {
        let unit = params.unit_id.unwrap_or(1);
        if unit == 0 || unit > 247 {
            return Err(ProtocolError::InvalidAddress(format!(
                "modbus unit id {} outside 1-247",
                unit
            )));
        }
        Ok(ModbusClient {
            device_id,
            protocol,
            params,
            policy,
            ctx: None,
        })
    }

    fn op_timeout(&self) -> Duration {
        self.params.connect_timeout()
    }

    fn context(&mut self) -> ProtocolResult<&mut client::Context> {
        self.ctx.as_mut().ok_or(ProtocolError::NotConnected)
    }

    async fn read_registers(
        &mut self,
        register_type: RegisterType,
        addr: u16,
        count: u16,
    ) -> ProtocolResult<Vec<u16>> {
        let deadline = self.op_timeout();
        let ctx = self.context()?;
        let fut = async {
            match register_type {
                RegisterType::Holding => ctx.read_holding_registers(addr, count).await,
                RegisterType::Input => ctx.read_input_registers(addr, count).await,
                _ => unreachable!("discrete classes use read_bits"),
            }
        };
        lift(timeout(deadline, fut).await.map_err(|_| ProtocolError::Timeout)?)
    }

    async fn read_bits(
        &mut self,
        register_type: RegisterType,
        addr: u16,
        count: u16,
    ) -> ProtocolResult<Vec<bool>> {
        let deadline = self.op_timeout();
        let ctx = self.context()?;
        let fut = async {
            match register_type {
                RegisterType::Coil => ctx.read_coils(addr, count).await,
                RegisterType::DiscreteInput => ctx.read_discrete_inputs(addr, count).await,
                _ => unreachable!("register classes use read_registers"),
            }
        };
        lift(timeout(deadline, fut).await.map_err(|_| ProtocolError::Timeout)?)
    }

    /// Decode one tag's slice out of a register window.
    fn decode_from_window(tag: &Tag, window_start: u16, words: &[u16]) -> ProtocolResult<Value> {
        let (_, addr) = resolve_address(tag)?;
        let span = register_span(tag)?;
        let lo = (addr - window_start) as usize;
        let slice = words
            .get(lo..lo + span as usize)
            .ok_or(ProtocolError::InvalidDataLength {
                expected: span as usize * 2,
                actual: words.len().saturating_sub(lo) * 2,
            })?;

        if tag.data_type == DataType::Bool {
            let word = slice[0];
            return Ok(match tag.bit {
                Some(bit) => Value::Bool(codec::bit_from_word(word, bit)),
                None => Value::Bool(word != 0),
            });
        }
        codec::decode(
            &codec::registers_to_bytes(slice),
            tag.data_type,
            tag.byte_order,
        )
    }
}

fn lift<T>(rsp: Result<Result<T, tokio_modbus::Exception>, tokio_modbus::Error>) -> ProtocolResult<T> {
    match rsp {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(exc)) => Err(ProtocolError::ModbusException { code: exc as u8 }),
        Err(err) => Err(transport_error(err)),
    }
}

fn transport_error(err: tokio_modbus::Error) -> ProtocolError {
    match err {
        tokio_modbus::Error::Transport(io) => match io.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ProtocolError::Timeout
            }
            std::io::ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionFailed(io.to_string())
            }
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::NotConnected => ProtocolError::ConnectionClosed(io.to_string()),
            _ => ProtocolError::Io(io),
        },
        other => ProtocolError::ReadFailed(other.to_string()),
    }
}

/// Resolve a tag to its register class and 0-based offset using the
/// classic numbering: 0xxxx coils, 1xxxx discrete inputs, 3xxxx input
/// registers, 4xxxx holding registers. An explicit `register_type` on the
/// tag must agree with the address range.
pub fn resolve_address(tag: &Tag) -> ProtocolResult<(RegisterType, u16)> {
    let addr: u32 = tag
        .address
        .parse()
        .map_err(|_| ProtocolError::InvalidAddress(format!("invalid address: {}", tag.address)))?;

    let (register_type, offset) = match addr {
        1..=9999 => (RegisterType::Coil, (addr - 1) as u16),
        10001..=19999 => (RegisterType::DiscreteInput, (addr - 10001) as u16),
        30001..=39999 => (RegisterType::Input, (addr - 30001) as u16),
        40001..=49999 => (RegisterType::Holding, (addr - 40001) as u16),
        _ => {
            return Err(ProtocolError::InvalidAddress(format!(
                "address out of range: {}",
                tag.address
            )))
        }
    };

    if let Some(declared) = tag.register_type {
        if declared != register_type {
            return Err(ProtocolError::InvalidAddress(format!(
                "address {} is a {:?} register but tag declares {:?}",
                tag.address, register_type, declared
            )));
        }
    }

    Ok((register_type, offset))
}

fn register_span(tag: &Tag) -> ProtocolResult<u16> {
    tag.data_type.register_count().ok_or_else(|| {
        ProtocolError::InvalidDataType(format!(
            "{:?} is not representable in modbus registers",
            tag.data_type
        ))
    })
}

/// One merged wire read covering several tags.
#[derive(Debug, PartialEq, Eq)]
struct ReadWindow {
    start: u16,
    count: u16,
    /// `(tag index, tag offset)` pairs covered by this window.
    members: Vec<(usize, u16)>,
}

/// Merge sorted `(index, offset, span)` triples into contiguous windows.
/// Adjacent or overlapping ranges coalesce; a gap or the per-request cap
/// starts a new window.
fn plan_windows(ranges: &[(usize, u16, u16)], cap: u16) -> Vec<ReadWindow> {
    let mut sorted: Vec<_> = ranges.to_vec();
    sorted.sort_by_key(|(_, offset, _)| *offset);

    let mut windows: Vec<ReadWindow> = Vec::new();
    for (idx, offset, span) in sorted {
        let end = offset + span;
        match windows.last_mut() {
            Some(w) if offset <= w.start + w.count && end - w.start <= cap => {
                w.count = w.count.max(end - w.start);
                w.members.push((idx, offset));
            }
            _ => windows.push(ReadWindow {
                start: offset,
                count: span,
                members: vec![(idx, offset)],
            }),
        }
    }
    windows
}

#[async_trait]
impl ProtocolClient for ModbusClient {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    async fn connect(&mut self) -> ProtocolResult<()> {
        if self.ctx.is_some() {
            return Ok(());
        }
        let slave = Slave(self.params.unit_id.unwrap_or(1));

        let ctx = match self.protocol {
            Protocol::ModbusTcp => {
                let socket_addr: SocketAddr = self.params.endpoint.parse().map_err(|e| {
                    ProtocolError::InvalidAddress(format!(
                        "invalid socket address {}: {}",
                        self.params.endpoint, e
                    ))
                })?;
                timeout(
                    self.params.connect_timeout(),
                    tcp::connect_slave(socket_addr, slave),
                )
                .await
                .map_err(|_| {
                    ProtocolError::ConnectionTimeout(format!(
                        "connect to {} timed out",
                        self.params.endpoint
                    ))
                })?
                .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?
            }
            Protocol::ModbusRtu => {
                let builder = tokio_serial::new(
                    self.params.endpoint.clone(),
                    self.params.baud_rate.unwrap_or(9600),
                );
                let port = tokio_serial::SerialStream::open(&builder)
                    .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
                rtu::attach_slave(port, slave)
            }
            other => {
                return Err(ProtocolError::ConnectionFailed(format!(
                    "modbus client cannot speak {}",
                    other
                )))
            }
        };

        info!(
            device = %self.device_id,
            endpoint = %self.params.endpoint,
            unit = slave.0,
            "modbus connected"
        );
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn disconnect(&mut self) -> ProtocolResult<()> {
        if let Some(mut ctx) = self.ctx.take() {
            let _ = ctx.disconnect().await;
            debug!(device = %self.device_id, "modbus disconnected");
        }
        Ok(())
    }

    /// A device that answers anything, even an exception, is alive.
    async fn probe(&mut self) -> ProtocolResult<()> {
        match self.read_registers(RegisterType::Holding, 0, 1).await {
            Ok(_) | Err(ProtocolError::ModbusException { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn read_value(&mut self, tag: &Tag) -> ProtocolResult<RawReading> {
        let (register_type, addr) = resolve_address(tag)?;

        if register_type.is_discrete() {
            if tag.data_type != DataType::Bool {
                return Err(ProtocolError::InvalidDataType(format!(
                    "{:?} tag on a 1-bit {:?} register",
                    tag.data_type, register_type
                )));
            }
            let bits = self.read_bits(register_type, addr, 1).await?;
            return Ok(RawReading::new(Value::Bool(bits[0])));
        }

        let span = register_span(tag)?;
        let words = self.read_registers(register_type, addr, span).await?;
        let value = Self::decode_from_window(tag, addr, &words)?;
        Ok(RawReading::new(value))
    }

    /// Grouped read: tags are bucketed by register class, contiguous
    /// ranges merge into single requests, and a failed window only marks
    /// its own tags bad.
    async fn read_tags(&mut self, tags: &[Tag]) -> Vec<DataPoint> {
        let mut points: Vec<Option<DataPoint>> = (0..tags.len()).map(|_| None).collect();
        let mut groups: BTreeMap<u8, Vec<(usize, u16, u16)>> = BTreeMap::new();
        let mut group_types: BTreeMap<u8, RegisterType> = BTreeMap::new();

        for (i, tag) in tags.iter().enumerate() {
            let planned = resolve_address(tag).and_then(|(rt, addr)| {
                let span = if rt.is_discrete() {
                    if tag.data_type != DataType::Bool {
                        return Err(ProtocolError::InvalidDataType(format!(
                            "{:?} tag on a 1-bit {:?} register",
                            tag.data_type, rt
                        )));
                    }
                    1
                } else {
                    register_span(tag)?
                };
                Ok((rt, addr, span))
            });
            match planned {
                Ok((rt, addr, span)) => {
                    let key = rt as u8;
                    group_types.insert(key, rt);
                    groups.entry(key).or_default().push((i, addr, span));
                }
                Err(e) => {
                    points[i] = Some(DataPoint::failed(&self.device_id, tag, e.quality()));
                }
            }
        }

        for (key, ranges) in groups {
            let register_type = group_types[&key];
            let cap = if register_type.is_discrete() {
                MAX_BITS_PER_READ
            } else {
                MAX_REGISTERS_PER_READ
            };

            for window in plan_windows(&ranges, cap) {
                if register_type.is_discrete() {
                    match self
                        .read_bits(register_type, window.start, window.count)
                        .await
                    {
                        Ok(bits) => {
                            for &(i, addr) in &window.members {
                                let tag = &tags[i];
                                let bit = bits[(addr - window.start) as usize];
                                points[i] = Some(point_from_raw(
                                    &self.device_id,
                                    tag,
                                    RawReading::new(Value::Bool(bit)),
                                ));
                            }
                        }
                        Err(e) => {
                            warn!(
                                device = %self.device_id,
                                start = window.start,
                                count = window.count,
                                error = %e,
                                "bit window read failed"
                            );
                            let quality = e.quality();
                            for &(i, _) in &window.members {
                                points[i] =
                                    Some(DataPoint::failed(&self.device_id, &tags[i], quality));
                            }
                        }
                    }
                } else {
                    match self
                        .read_registers(register_type, window.start, window.count)
                        .await
                    {
                        Ok(words) => {
                            for &(i, _) in &window.members {
                                let tag = &tags[i];
                                points[i] = Some(
                                    match Self::decode_from_window(tag, window.start, &words) {
                                        Ok(value) => point_from_raw(
                                            &self.device_id,
                                            tag,
                                            RawReading::new(value),
                                        ),
                                        Err(e) => {
                                            DataPoint::failed(&self.device_id, tag, e.quality())
                                        }
                                    },
                                );
                            }
                        }
                        Err(e) => {
                            warn!(
                                device = %self.device_id,
                                start = window.start,
                                count = window.count,
                                error = %e,
                                "register window read failed"
                            );
                            let quality = e.quality();
                            for &(i, _) in &window.members {
                                points[i] =
                                    Some(DataPoint::failed(&self.device_id, &tags[i], quality));
                            }
                        }
                    }
                }
            }
        }

        points
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                p.unwrap_or_else(|| {
                    DataPoint::failed(&self.device_id, &tags[i], crate::model::Quality::Bad)
                })
            })
            .collect()
    }

    async fn write_value(&mut self, tag: &Tag, value: &Value) -> ProtocolResult<()> {
        let (register_type, addr) = resolve_address(tag)?;
        let deadline = self.op_timeout();

        match register_type {
            RegisterType::Coil => {
                let state = value.as_bool().ok_or_else(|| {
                    ProtocolError::InvalidDataType(format!(
                        "cannot write {} value to a coil",
                        value.type_name()
                    ))
                })?;
                let ctx = self.context()?;
                lift(
                    timeout(deadline, ctx.write_single_coil(addr, state))
                        .await
                        .map_err(|_| ProtocolError::Timeout)?,
                )
            }
            RegisterType::Holding => {
                if tag.data_type == DataType::Bool {
                    let state = value.as_bool().ok_or_else(|| {
                        ProtocolError::InvalidDataType("boolean register write needs a bool".into())
                    })?;
                    // Packed bit: read-modify-write the surrounding word.
                    if let Some(bit) = tag.bit {
                        let words = self.read_registers(RegisterType::Holding, addr, 1).await?;
                        let mask = 1u16 << (bit as u16 % 16);
                        let word = if state {
                            words[0] | mask
                        } else {
                            words[0] & !mask
                        };
                        let ctx = self.context()?;
                        return lift(
                            timeout(deadline, ctx.write_single_register(addr, word))
                                .await
                                .map_err(|_| ProtocolError::Timeout)?,
                        );
                    }
                    let ctx = self.context()?;
                    return lift(
                        timeout(
                            deadline,
                            ctx.write_single_register(addr, u16::from(state)),
                        )
                        .await
                        .map_err(|_| ProtocolError::Timeout)?,
                    );
                }

                let bytes = codec::encode(value, tag.data_type, tag.byte_order)?;
                let words = codec::bytes_to_registers(&bytes)?;
                let ctx = self.context()?;
                if words.len() == 1 {
                    lift(
                        timeout(deadline, ctx.write_single_register(addr, words[0]))
                            .await
                            .map_err(|_| ProtocolError::Timeout)?,
                    )
                } else {
                    lift(
                        timeout(deadline, ctx.write_multiple_registers(addr, &words))
                            .await
                            .map_err(|_| ProtocolError::Timeout)?,
                    )
                }
            }
            RegisterType::DiscreteInput | RegisterType::Input => {
                Err(ProtocolError::WriteNotPermitted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccessMode, ByteOrder};

    fn tag_at(address: &str, data_type: DataType) -> Tag {
        Tag {
            id: format!("tag-{}", address),
            name: String::new(),
            address: address.to_string(),
            data_type,
            register_type: None,
            byte_order: ByteOrder::BigEndian,
            bit: None,
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
            access: AccessMode::ReadWrite,
            enabled: true,
            topic_suffix: "t".into(),
            deadband: None,
        }
    }

    #[test]
    fn resolve_coil_address() {
        let (rt, addr) = resolve_address(&tag_at("00001", DataType::Bool)).unwrap();
        assert_eq!(rt, RegisterType::Coil);
        assert_eq!(addr, 0);

        let (rt, addr) = resolve_address(&tag_at("00100", DataType::Bool)).unwrap();
        assert_eq!(rt, RegisterType::Coil);
        assert_eq!(addr, 99);
    }

    #[test]
    fn resolve_discrete_input_address() {
        let (rt, addr) = resolve_address(&tag_at("10001", DataType::Bool)).unwrap();
        assert_eq!(rt, RegisterType::DiscreteInput);
        assert_eq!(addr, 0);
    }

    #[test]
    fn resolve_input_register_address() {
        let (rt, addr) = resolve_address(&tag_at("30005", DataType::Int16)).unwrap();
        assert_eq!(rt, RegisterType::Input);
        assert_eq!(addr, 4);
    }

    #[test]
    fn resolve_holding_register_address() {
        let (rt, addr) = resolve_address(&tag_at("40001", DataType::Float32)).unwrap();
        assert_eq!(rt, RegisterType::Holding);
        assert_eq!(addr, 0);
    }

    #[test]
    fn resolve_rejects_garbage_and_out_of_range() {
        assert!(resolve_address(&tag_at("invalid", DataType::Int16)).is_err());
        assert!(resolve_address(&tag_at("99999", DataType::Int16)).is_err());
    }

    #[test]
    fn declared_register_type_must_match_range() {
        let mut tag = tag_at("40001", DataType::Int16);
        tag.register_type = Some(RegisterType::Holding);
        assert!(resolve_address(&tag).is_ok());

        tag.register_type = Some(RegisterType::Input);
        assert!(matches!(
            resolve_address(&tag).unwrap_err(),
            ProtocolError::InvalidAddress(_)
        ));
    }

    #[test]
    fn unit_id_bounds() {
        let mut params = ConnectionParams {
            endpoint: "127.0.0.1:502".into(),
            unit_id: Some(0),
            baud_rate: None,
            rack: None,
            slot: None,
            security_policy: None,
            security_mode: None,
            username: None,
            password: None,
            cert_path: None,
            key_path: None,
            connect_timeout_ms: 1000,
        };
        assert!(ModbusClient::new(
            "d".into(),
            Protocol::ModbusTcp,
            params.clone(),
            RetryPolicy::default()
        )
        .is_err());

        params.unit_id = Some(247);
        assert!(ModbusClient::new(
            "d".into(),
            Protocol::ModbusTcp,
            params,
            RetryPolicy::default()
        )
        .is_ok());
    }

    #[test]
    fn windows_merge_contiguous_ranges() {
        // Float32 at offsets 0 and 2, Int16 at 10.
        let ranges = vec![(0usize, 0u16, 2u16), (1, 2, 2), (2, 10, 1)];
        let windows = plan_windows(&ranges, 120);
        assert_eq!(
            windows,
            vec![
                ReadWindow {
                    start: 0,
                    count: 4,
                    members: vec![(0, 0), (1, 2)]
                },
                ReadWindow {
                    start: 10,
                    count: 1,
                    members: vec![(2, 10)]
                },
            ]
        );
    }

    #[test]
    fn windows_respect_request_cap() {
        let ranges = vec![(0usize, 0u16, 100u16), (1, 100, 100)];
        let windows = plan_windows(&ranges, 120);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].count, 100);
        assert_eq!(windows[1].start, 100);
    }

    #[test]
    fn windows_handle_overlapping_tags() {
        // A UInt16 inside the span of a Float32.
        let ranges = vec![(0usize, 0u16, 2u16), (1, 1, 1)];
        let windows = plan_windows(&ranges, 120);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].count, 2);
        assert_eq!(windows[0].members, vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn decode_from_window_slices_by_offset() {
        let tag = tag_at("40003", DataType::Float32);
        // Window starts at offset 0; tag lives at offset 2.
        let words = vec![0x0000, 0x0000, 0x41C8, 0x0000];
        let value = ModbusClient::decode_from_window(&tag, 0, &words).unwrap();
        assert_eq!(value, Value::Float(25.0));
    }

    #[test]
    fn decode_bit_from_packed_register() {
        let mut tag = tag_at("40001", DataType::Bool);
        tag.bit = Some(3);
        let value = ModbusClient::decode_from_window(&tag, 0, &[0b0000_1000]).unwrap();
        assert_eq!(value, Value::Bool(true));

        tag.bit = Some(2);
        let value = ModbusClient::decode_from_window(&tag, 0, &[0b0000_1000]).unwrap();
        assert_eq!(value, Value::Bool(false));
    }
}
