//! Compact JSON data payload: `{v,u,q,ts,src_ts?,dev,tag}`.
//!
//! The gateway emits timestamps as Unix milliseconds. The ingestion side
//! accepts that, plus RFC3339 strings (with or without fractional
//! seconds) from other producers, and falls back to the receive time when
//! the timestamp is missing or unparseable.

use crate::error::{IngestError, IngestResult};
use crate::model::{DataPoint, Quality, Value};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

#[derive(Debug, Serialize)]
pub struct PointPayload<'a> {
    pub v: &'a Value,
    pub u: &'a str,
    pub q: Quality,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_ts: Option<i64>,
    pub dev: &'a str,
    pub tag: &'a str,
}

impl<'a> PointPayload<'a> {
    pub fn from_point(point: &'a DataPoint) -> Self {
        PointPayload {
            v: &point.value,
            u: &point.unit,
            q: point.quality,
            ts: point
                .server_ts
                .unwrap_or_else(Utc::now)
                .timestamp_millis(),
            src_ts: point.source_ts.map(|t| t.timestamp_millis()),
            dev: &point.device_id,
            tag: &point.tag_id,
        }
    }
}

/// Serialize a point for publishing.
pub fn encode(point: &DataPoint) -> Vec<u8> {
    serde_json::to_vec(&PointPayload::from_point(point)).unwrap_or_default()
}

/// Loosely-typed inbound shape; every field is optional except the value.
#[derive(Debug, Deserialize)]
struct InboundPayload<'a> {
    v: serde_json::Value,
    #[serde(default)]
    u: Option<String>,
    #[serde(default)]
    q: Option<QualityField>,
    #[serde(default, borrow)]
    ts: Option<&'a RawValue>,
    #[serde(default, borrow)]
    src_ts: Option<&'a RawValue>,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    tag: Option<String>,
}

/// Quality arrives as a string name or a numeric OPC UA code.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QualityField {
    Name(String),
    Code(i16),
}

impl QualityField {
    fn quality(&self) -> Quality {
        match self {
            QualityField::Name(s) => Quality::parse(s),
            QualityField::Code(c) => Quality::from_code(*c),
        }
    }
}

/// Best-effort timestamp: Unix millis, then RFC3339 (nanosecond precision
/// included), then `None`.
fn parse_timestamp(raw: &RawValue) -> Option<DateTime<Utc>> {
    let text = raw.get();
    if let Ok(millis) = text.parse::<i64>() {
        return Utc.timestamp_millis_opt(millis).single();
    }
    if let Ok(s) = serde_json::from_str::<String>(text) {
        if let Ok(ts) = DateTime::parse_from_rfc3339(&s) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    None
}

/// Parse one broker message into a datapoint. `received_at` doubles as
/// the timestamp fallback.
pub fn parse(topic: &str, bytes: &[u8], received_at: DateTime<Utc>) -> IngestResult<DataPoint> {
    let inbound: InboundPayload = serde_json::from_slice(bytes)
        .map_err(|e| IngestError::MalformedPayload(e.to_string()))?;

    if inbound.v.is_array() || inbound.v.is_object() {
        return Err(IngestError::MalformedPayload(
            "value must be a scalar".into(),
        ));
    }

    let server_ts = inbound
        .ts
        .and_then(parse_timestamp)
        .unwrap_or(received_at);

    Ok(DataPoint {
        topic: topic.to_string(),
        device_id: inbound.dev.unwrap_or_default(),
        tag_id: inbound.tag.unwrap_or_default(),
        value: Value::from_json(&inbound.v),
        quality: inbound
            .q
            .map(|q| q.quality())
            .unwrap_or(Quality::Good),
        unit: inbound.u.unwrap_or_default(),
        source_ts: inbound.src_ts.and_then(parse_timestamp),
        server_ts: Some(server_ts),
        received_at: Some(received_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point() -> DataPoint {
        DataPoint {
            topic: "acme/site1/line2/plc-001/temperature".into(),
            device_id: "plc-001".into(),
            tag_id: "temperature".into(),
            value: Value::Float(2.5),
            quality: Quality::Good,
            unit: "°C".into(),
            source_ts: None,
            server_ts: Some(Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap()),
            received_at: None,
        }
    }

    #[test]
    fn encoded_shape_matches_contract() {
        let bytes = encode(&point());
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["v"], 2.5);
        assert_eq!(json["u"], "°C");
        assert_eq!(json["q"], "good");
        assert_eq!(json["ts"], 1_700_000_000_000i64);
        assert_eq!(json["dev"], "plc-001");
        assert_eq!(json["tag"], "temperature");
        assert!(json.get("src_ts").is_none());
    }

    #[test]
    fn round_trip_through_parse() {
        let bytes = encode(&point());
        let now = Utc::now();
        let parsed = parse("acme/site1/line2/plc-001/temperature", &bytes, now).unwrap();
        assert_eq!(parsed.value, Value::Float(2.5));
        assert_eq!(parsed.quality, Quality::Good);
        assert_eq!(parsed.device_id, "plc-001");
        assert_eq!(
            parsed.server_ts.unwrap().timestamp_millis(),
            1_700_000_000_000
        );
        assert_eq!(parsed.received_at, Some(now));
    }

    #[test]
    fn rfc3339_timestamps_accepted() {
        let now = Utc::now();
        let parsed = parse(
            "t",
            br#"{"v": 1, "ts": "2024-05-01T12:30:00.123456789Z"}"#,
            now,
        )
        .unwrap();
        let ts = parsed.server_ts.unwrap();
        assert_eq!(ts.timestamp(), 1_714_566_600);
    }

    #[test]
    fn missing_timestamp_falls_back_to_received_at() {
        let now = Utc::now();
        let parsed = parse("t", br#"{"v": 42}"#, now).unwrap();
        assert_eq!(parsed.server_ts, Some(now));
    }

    #[test]
    fn garbage_timestamp_falls_back_to_received_at() {
        let now = Utc::now();
        let parsed = parse("t", br#"{"v": 42, "ts": "yesterday-ish"}"#, now).unwrap();
        assert_eq!(parsed.server_ts, Some(now));
    }

    #[test]
    fn missing_quality_defaults_to_good() {
        let parsed = parse("t", br#"{"v": 1.0}"#, Utc::now()).unwrap();
        assert_eq!(parsed.quality, Quality::Good);
        assert_eq!(parsed.quality.code(), 192);
    }

    #[test]
    fn numeric_quality_codes_accepted() {
        let parsed = parse("t", br#"{"v": 1.0, "q": 64}"#, Utc::now()).unwrap();
        assert_eq!(parsed.quality, Quality::Uncertain);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse("t", b"{not json", Utc::now()).is_err());
        assert!(parse("t", br#"{"v": [1,2]}"#, Utc::now()).is_err());
    }

    #[test]
    fn string_values_survive() {
        let parsed = parse("t", br#"{"v": "RUNNING"}"#, Utc::now()).unwrap();
        assert_eq!(parsed.value, Value::Text("RUNNING".into()));
    }
}
