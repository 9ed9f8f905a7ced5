//! Raw-byte normalization: `DataType × ByteOrder` decode/encode plus
//! engineering scaling.
//!
//! The canonical wire form is big-endian; every other byte order is a
//! permutation of it. All four permutations are involutions, so decode
//! applies the same permutation as encode and then reads big-endian.
//! Reads go raw → typed → scaled; writes run the exact inverse, rejecting
//! values that do not fit the target type instead of truncating them.

use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{ByteOrder, DataType, Tag, Value};

/// Apply the byte-order permutation in place.
pub fn permute(bytes: &mut [u8], order: ByteOrder) {
    match order {
        ByteOrder::BigEndian => {}
        ByteOrder::LittleEndian => bytes.reverse(),
        ByteOrder::WordSwap => {
            for pair in bytes.chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
        }
        ByteOrder::ByteSwap => {
            for quad in bytes.chunks_exact_mut(4) {
                quad.swap(0, 2);
                quad.swap(1, 3);
            }
        }
    }
}

/// Decode raw wire bytes into a typed value.
pub fn decode(bytes: &[u8], data_type: DataType, order: ByteOrder) -> ProtocolResult<Value> {
    if let Some(expected) = data_type.byte_len() {
        // A boolean may arrive as a single byte or a whole register.
        let ok = if data_type == DataType::Bool {
            bytes.len() == 1 || bytes.len() == 2
        } else {
            bytes.len() == expected
        };
        if !ok {
            return Err(ProtocolError::InvalidDataLength {
                expected,
                actual: bytes.len(),
            });
        }
    }

    let mut buf = bytes.to_vec();
    permute(&mut buf, order);

    let value = match data_type {
        DataType::Bool => Value::Bool(buf.iter().any(|b| *b != 0)),
        DataType::Int16 => Value::Int(i16::from_be_bytes([buf[0], buf[1]]) as i64),
        DataType::UInt16 => Value::UInt(u16::from_be_bytes([buf[0], buf[1]]) as u64),
        DataType::Int32 => {
            Value::Int(i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as i64)
        }
        DataType::UInt32 => {
            Value::UInt(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64)
        }
        DataType::Int64 => Value::Int(i64::from_be_bytes(to_array8(&buf)?)),
        DataType::UInt64 => Value::UInt(u64::from_be_bytes(to_array8(&buf)?)),
        DataType::Float32 => {
            Value::Float(f32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64)
        }
        DataType::Float64 => Value::Float(f64::from_be_bytes(to_array8(&buf)?)),
        DataType::String => {
            let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
            let s = std::str::from_utf8(&buf[..end])
                .map_err(|e| ProtocolError::InvalidDataType(format!("non-utf8 string: {}", e)))?;
            Value::Text(s.to_string())
        }
    };

    Ok(value)
}

/// Encode a typed value into raw wire bytes. The value must already be
/// coerced to `data_type` (see [`coerce`]).
pub fn encode(value: &Value, data_type: DataType, order: ByteOrder) -> ProtocolResult<Vec<u8>> {
    let mut buf = match (data_type, value) {
        (DataType::Bool, Value::Bool(b)) => vec![u8::from(*b)],
        (DataType::Int16, Value::Int(v)) => (*v as i16).to_be_bytes().to_vec(),
        (DataType::UInt16, Value::UInt(v)) => (*v as u16).to_be_bytes().to_vec(),
        (DataType::Int32, Value::Int(v)) => (*v as i32).to_be_bytes().to_vec(),
        (DataType::UInt32, Value::UInt(v)) => (*v as u32).to_be_bytes().to_vec(),
        (DataType::Int64, Value::Int(v)) => v.to_be_bytes().to_vec(),
        (DataType::UInt64, Value::UInt(v)) => v.to_be_bytes().to_vec(),
        (DataType::Float32, Value::Float(v)) => (*v as f32).to_be_bytes().to_vec(),
        (DataType::Float64, Value::Float(v)) => v.to_be_bytes().to_vec(),
        (DataType::String, Value::Text(s)) => s.as_bytes().to_vec(),
        (dt, v) => {
            return Err(ProtocolError::InvalidDataType(format!(
                "cannot encode {} value as {:?}",
                v.type_name(),
                dt
            )))
        }
    };

    permute(&mut buf, order);
    Ok(buf)
}

fn to_array8(buf: &[u8]) -> ProtocolResult<[u8; 8]> {
    buf.try_into().map_err(|_| ProtocolError::InvalidDataLength {
        expected: 8,
        actual: buf.len(),
    })
}

/// Coerce a loosely-typed value (e.g. from a command payload) into the
/// exact representation `data_type` demands. Out-of-range values are
/// rejected, never truncated.
pub fn coerce(value: &Value, data_type: DataType) -> ProtocolResult<Value> {
    let out_of_range = |v: &dyn std::fmt::Display| {
        ProtocolError::InvalidDataType(format!("value {} out of range for {:?}", v, data_type))
    };

    match data_type {
        DataType::Bool => value
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| ProtocolError::InvalidDataType(format!(
                "cannot convert {} to bool",
                value.type_name()
            ))),
        DataType::String => match value {
            Value::Text(s) => Ok(Value::Text(s.clone())),
            other => Ok(Value::Text(other.to_string())),
        },
        DataType::Float32 => {
            let f = numeric(value, data_type)?;
            if f.is_finite() && f.abs() > f32::MAX as f64 {
                return Err(out_of_range(&f));
            }
            Ok(Value::Float(f))
        }
        DataType::Float64 => Ok(Value::Float(numeric(value, data_type)?)),
        DataType::Int16 => signed_in(value, data_type, i16::MIN as i64, i16::MAX as i64),
        DataType::Int32 => signed_in(value, data_type, i32::MIN as i64, i32::MAX as i64),
        DataType::Int64 => signed_in(value, data_type, i64::MIN, i64::MAX),
        DataType::UInt16 => unsigned_in(value, data_type, u16::MAX as u64),
        DataType::UInt32 => unsigned_in(value, data_type, u32::MAX as u64),
        DataType::UInt64 => unsigned_in(value, data_type, u64::MAX),
    }
}

fn numeric(value: &Value, data_type: DataType) -> ProtocolResult<f64> {
    value.as_f64().ok_or_else(|| {
        ProtocolError::InvalidDataType(format!(
            "cannot convert {} to {:?}",
            value.type_name(),
            data_type
        ))
    })
}

fn signed_in(value: &Value, data_type: DataType, min: i64, max: i64) -> ProtocolResult<Value> {
    let v = match value {
        Value::Int(v) => *v,
        Value::UInt(v) => i64::try_from(*v).map_err(|_| {
            ProtocolError::InvalidDataType(format!("value {} out of range for {:?}", v, data_type))
        })?,
        Value::Float(f) => float_to_i64(*f, data_type)?,
        Value::Bool(b) => i64::from(*b),
        other => {
            return Err(ProtocolError::InvalidDataType(format!(
                "cannot convert {} to {:?}",
                other.type_name(),
                data_type
            )))
        }
    };
    if v < min || v > max {
        return Err(ProtocolError::InvalidDataType(format!(
            "value {} out of range for {:?}",
            v, data_type
        )));
    }
    Ok(Value::Int(v))
}

fn unsigned_in(value: &Value, data_type: DataType, max: u64) -> ProtocolResult<Value> {
    let v = match value {
        Value::UInt(v) => *v,
        Value::Int(v) => u64::try_from(*v).map_err(|_| {
            ProtocolError::InvalidDataType(format!("value {} out of range for {:?}", v, data_type))
        })?,
        Value::Float(f) => {
            let i = float_to_i64(*f, data_type)?;
            u64::try_from(i).map_err(|_| {
                ProtocolError::InvalidDataType(format!(
                    "value {} out of range for {:?}",
                    i, data_type
                ))
            })?
        }
        Value::Bool(b) => u64::from(*b),
        other => {
            return Err(ProtocolError::InvalidDataType(format!(
                "cannot convert {} to {:?}",
                other.type_name(),
                data_type
            )))
        }
    };
    if v > max {
        return Err(ProtocolError::InvalidDataType(format!(
            "value {} out of range for {:?}",
            v, data_type
        )));
    }
    Ok(Value::UInt(v))
}

fn float_to_i64(f: f64, data_type: DataType) -> ProtocolResult<i64> {
    if !f.is_finite() || f < i64::MIN as f64 || f > i64::MAX as f64 {
        return Err(ProtocolError::InvalidDataType(format!(
            "value {} out of range for {:?}",
            f, data_type
        )));
    }
    Ok(f.round() as i64)
}

/// Raw → engineering units: `value·scale + offset`. Identity when the tag
/// carries no scaling; non-numeric values pass through untouched.
pub fn apply_scaling(tag: &Tag, value: Value) -> Value {
    if !tag.has_scaling() {
        return value;
    }
    match value.as_f64() {
        Some(f) if !matches!(value, Value::Bool(_)) => Value::Float(f * tag.scale + tag.offset),
        _ => value,
    }
}

/// Engineering units → raw: `(value − offset) / scale`, then coercion to
/// the tag's data type. A zero scale cannot be inverted.
pub fn reverse_scaling(tag: &Tag, value: &Value) -> ProtocolResult<Value> {
    if !tag.has_scaling() {
        return coerce(value, tag.data_type);
    }
    if tag.scale == 0.0 {
        return Err(ProtocolError::InvalidDataType(
            "scale factor 0 is not reversible".to_string(),
        ));
    }
    let f = value.as_f64().ok_or_else(|| {
        ProtocolError::InvalidDataType(format!(
            "cannot apply scaling to {} value",
            value.type_name()
        ))
    })?;
    coerce(&Value::Float((f - tag.offset) / tag.scale), tag.data_type)
}

/// Pack wire bytes into 16-bit Modbus registers (big-endian per word).
pub fn bytes_to_registers(bytes: &[u8]) -> ProtocolResult<Vec<u16>> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::InvalidDataLength {
            expected: bytes.len() + 1,
            actual: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|p| u16::from_be_bytes([p[0], p[1]]))
        .collect())
}

/// Unpack 16-bit Modbus registers into wire bytes.
pub fn registers_to_bytes(words: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 2);
    for w in words {
        out.extend_from_slice(&w.to_be_bytes());
    }
    out
}

/// Extract a single bit from a register (`value & (1 << bit)`).
pub fn bit_from_word(word: u16, bit: u8) -> bool {
    word & (1u16 << (bit as u16 % 16)) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AccessMode;

    fn tag_with(data_type: DataType, scale: f64, offset: f64) -> Tag {
        Tag {
            id: "t".into(),
            name: String::new(),
            address: "40001".into(),
            data_type,
            register_type: None,
            byte_order: ByteOrder::BigEndian,
            bit: None,
            scale,
            offset,
            unit: String::new(),
            access: AccessMode::ReadWrite,
            enabled: true,
            topic_suffix: "t".into(),
            deadband: None,
        }
    }

    const ALL_ORDERS: [ByteOrder; 4] = [
        ByteOrder::BigEndian,
        ByteOrder::LittleEndian,
        ByteOrder::WordSwap,
        ByteOrder::ByteSwap,
    ];

    #[test]
    fn permutations_are_involutions() {
        for order in ALL_ORDERS {
            for len in [2usize, 4, 8] {
                let original: Vec<u8> = (0..len as u8).collect();
                let mut buf = original.clone();
                permute(&mut buf, order);
                permute(&mut buf, order);
                assert_eq!(buf, original, "{:?} len {}", order, len);
            }
        }
    }

    #[test]
    fn known_permutations() {
        let mut abcd = [0xAA, 0xBB, 0xCC, 0xDD];
        permute(&mut abcd, ByteOrder::LittleEndian);
        assert_eq!(abcd, [0xDD, 0xCC, 0xBB, 0xAA]);

        let mut abcd = [0xAA, 0xBB, 0xCC, 0xDD];
        permute(&mut abcd, ByteOrder::WordSwap);
        assert_eq!(abcd, [0xBB, 0xAA, 0xDD, 0xCC]);

        let mut abcd = [0xAA, 0xBB, 0xCC, 0xDD];
        permute(&mut abcd, ByteOrder::ByteSwap);
        assert_eq!(abcd, [0xCC, 0xDD, 0xAA, 0xBB]);
    }

    #[test]
    fn encode_decode_round_trip_every_pair() {
        let cases: Vec<(DataType, Value)> = vec![
            (DataType::Bool, Value::Bool(true)),
            (DataType::Int16, Value::Int(-12345)),
            (DataType::UInt16, Value::UInt(54321)),
            (DataType::Int32, Value::Int(-7_654_321)),
            (DataType::UInt32, Value::UInt(4_000_000_000)),
            (DataType::Int64, Value::Int(-9_007_199_254_740_993)),
            (DataType::UInt64, Value::UInt(18_000_000_000_000_000_000)),
            (DataType::Float32, Value::Float(25.0)),
            (DataType::Float64, Value::Float(-1234.56789)),
        ];
        for (dt, value) in cases {
            for order in ALL_ORDERS {
                let bytes = encode(&value, dt, order).unwrap();
                let back = decode(&bytes, dt, order).unwrap();
                assert_eq!(back, value, "{:?} {:?}", dt, order);
            }
        }
    }

    #[test]
    fn string_round_trip_big_endian() {
        let v = Value::Text("PUMP_OK".into());
        let bytes = encode(&v, DataType::String, ByteOrder::BigEndian).unwrap();
        assert_eq!(decode(&bytes, DataType::String, ByteOrder::BigEndian).unwrap(), v);
    }

    #[test]
    fn decode_known_float32_vector() {
        // 0x41C80000 is 25.0f32.
        let v = decode(&[0x41, 0xC8, 0x00, 0x00], DataType::Float32, ByteOrder::BigEndian)
            .unwrap();
        assert_eq!(v, Value::Float(25.0));
    }

    #[test]
    fn encode_known_float32_vector() {
        // 75.5f32 is 0x42970000.
        let bytes = encode(&Value::Float(75.5), DataType::Float32, ByteOrder::BigEndian).unwrap();
        assert_eq!(bytes, vec![0x42, 0x97, 0x00, 0x00]);
    }

    #[test]
    fn string_decode_stops_at_nul() {
        let v = decode(b"OK\0\0", DataType::String, ByteOrder::BigEndian).unwrap();
        assert_eq!(v, Value::Text("OK".into()));
    }

    #[test]
    fn length_mismatch_rejected() {
        let err = decode(&[0x00, 0x01], DataType::Float32, ByteOrder::BigEndian).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidDataLength { expected: 4, actual: 2 }
        ));
    }

    #[test]
    fn scaling_round_trip() {
        let tag = tag_with(DataType::Float32, 0.1, -40.0);
        let engineering = apply_scaling(&tag, Value::Int(650));
        match engineering {
            Value::Float(f) => assert!((f - 25.0).abs() < 1e-9),
            other => panic!("expected float, got {:?}", other),
        }
        let raw = reverse_scaling(&tag, &Value::Float(25.0)).unwrap();
        match raw {
            Value::Float(f) => assert!((f - 650.0).abs() < 1e-6),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn scaling_identity_preserves_integer_type() {
        let tag = tag_with(DataType::Int32, 1.0, 0.0);
        assert_eq!(apply_scaling(&tag, Value::Int(42)), Value::Int(42));
    }

    #[test]
    fn zero_scale_rejected_on_write() {
        let tag = tag_with(DataType::Int16, 0.0, 0.0);
        assert!(reverse_scaling(&tag, &Value::Float(1.0)).is_err());
    }

    #[test]
    fn coerce_rejects_overflow() {
        assert!(coerce(&Value::Int(70_000), DataType::Int16).is_err());
        assert!(coerce(&Value::Int(-1), DataType::UInt16).is_err());
        assert!(coerce(&Value::Float(1e20), DataType::Int32).is_err());
        assert!(coerce(&Value::Float(4e38), DataType::Float32).is_err());
    }

    #[test]
    fn coerce_rounds_floats_into_integers() {
        assert_eq!(coerce(&Value::Float(99.6), DataType::Int16).unwrap(), Value::Int(100));
        assert_eq!(coerce(&Value::Float(99.4), DataType::UInt32).unwrap(), Value::UInt(99));
    }

    #[test]
    fn register_packing() {
        let words = bytes_to_registers(&[0x41, 0xC8, 0x00, 0x00]).unwrap();
        assert_eq!(words, vec![0x41C8, 0x0000]);
        assert_eq!(registers_to_bytes(&words), vec![0x41, 0xC8, 0x00, 0x00]);
        assert!(bytes_to_registers(&[0x01]).is_err());
    }

    #[test]
    fn bit_extraction() {
        assert!(bit_from_word(0b0000_0100, 2));
        assert!(!bit_from_word(0b0000_0100, 3));
        assert!(bit_from_word(0x8000, 15));
    }
}
