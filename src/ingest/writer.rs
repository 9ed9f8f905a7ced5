//! Parallel bulk writers into the time-series store.
//!
//! Each writer streams whole batches through PostgreSQL's binary COPY
//! protocol: one statement per batch, binary framing. If the server
//! rejects COPY as unsupported (some wire-compatible stores do), the
//! writer drops to a single multi-row `INSERT ... SELECT UNNEST(...)`
//! statement for the rest of the process lifetime. Transient failures
//! retry the whole batch with exponential backoff; fatal failures count
//! and drop the batch; QoS 1 on ingress already bounds broker-side
//! loss, and the counters reconstruct the rest.

use super::batcher::{Batch, BatchPool};
use crate::error::{IngestError, IngestResult};
use crate::metrics;
use crate::model::{DataPoint, Value};
use crate::retry::RetryPolicy;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

const COPY_STATEMENT: &str =
    "COPY telemetry (time, topic, value, value_str, quality, metadata) \
     FROM STDIN WITH (FORMAT binary)";

const INSERT_STATEMENT: &str = r#"
    INSERT INTO telemetry (time, topic, value, value_str, quality, metadata)
    SELECT t.time, t.topic, t.value, t.value_str, t.quality, t.metadata::json
    FROM UNNEST(
        $1::timestamptz[],
        $2::text[],
        $3::float8[],
        $4::text[],
        $5::int2[],
        $6::text[]
    ) AS t(time, topic, value, value_str, quality, metadata)
"#;

pub struct TelemetryWriter {
    db: PgPool,
    policy: RetryPolicy,
    pool: Arc<BatchPool>,
    copy_supported: AtomicBool,
}

impl TelemetryWriter {
    pub fn new(db: PgPool, policy: RetryPolicy, pool: Arc<BatchPool>) -> Arc<Self> {
        Arc::new(TelemetryWriter {
            db,
            policy,
            pool,
            copy_supported: AtomicBool::new(true),
        })
    }

    /// Writer loop: competes with its siblings for batches until the
    /// channel closes.
    pub async fn run(self: Arc<Self>, batches: Arc<Mutex<mpsc::Receiver<Batch>>>) {
        loop {
            let batch = {
                let mut rx = batches.lock().await;
                rx.recv().await
            };
            let Some(batch) = batch else { break };
            self.write_batch(batch).await;
        }
        debug!("telemetry writer exited");
    }

    /// Write one batch, retrying transient failures. The batch is never
    /// mutated; on success its backing vector returns to the pool.
    pub async fn write_batch(&self, batch: Batch) {
        if batch.is_empty() {
            self.pool.put(batch.into_points());
            return;
        }
        let count = batch.len() as u64;

        let mut attempt: u32 = 0;
        loop {
            let started = Instant::now();
            let result = self.write_once(batch.points()).await;
            match result {
                Ok(method) => {
                    metrics::DB_WRITE_LATENCY
                        .with_label_values(&[method])
                        .observe(started.elapsed().as_secs_f64());
                    metrics::INGEST_WRITTEN.inc_by(count);
                    self.pool.put(batch.into_points());
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    metrics::INGEST_BATCH_RETRIES.inc();
                    warn!(
                        count = count,
                        attempt = attempt,
                        error = %e,
                        "batch write failed, retrying"
                    );
                    self.policy.backoff(attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    metrics::INGEST_WRITE_ERRORS.inc();
                    error!(count = count, error = %e, "batch dropped after write failure");
                    // The vector is still reusable even though the rows
                    // are lost.
                    self.pool.put(batch.into_points());
                    return;
                }
            }
        }
    }

    async fn write_once(&self, points: &[DataPoint]) -> IngestResult<&'static str> {
        if self.copy_supported.load(Ordering::Acquire) {
            match self.copy_in(points).await {
                Ok(()) => return Ok("copy"),
                Err(e) if is_copy_unsupported(&e) => {
                    info!("store rejected COPY, falling back to multi-row inserts");
                    self.copy_supported.store(false, Ordering::Release);
                }
                Err(e) => return Err(e),
            }
        }
        self.insert_unnest(points).await.map(|_| "insert")
    }

    async fn copy_in(&self, points: &[DataPoint]) -> IngestResult<()> {
        let payload = encode_copy_rows(points);
        let mut conn = self.db.acquire().await?;
        let mut sink = conn.copy_in_raw(COPY_STATEMENT).await?;
        if let Err(e) = sink.send(payload).await {
            let _ = sink.abort("encoding failure").await;
            return Err(e.into());
        }
        sink.finish().await?;
        Ok(())
    }

    async fn insert_unnest(&self, points: &[DataPoint]) -> IngestResult<()> {
        let mut times: Vec<DateTime<Utc>> = Vec::with_capacity(points.len());
        let mut topics: Vec<String> = Vec::with_capacity(points.len());
        let mut values: Vec<Option<f64>> = Vec::with_capacity(points.len());
        let mut value_strs: Vec<Option<String>> = Vec::with_capacity(points.len());
        let mut qualities: Vec<i16> = Vec::with_capacity(points.len());
        let mut metadata: Vec<Option<String>> = Vec::with_capacity(points.len());

        for point in points {
            let (value, value_str) = split_value(point);
            times.push(row_time(point));
            topics.push(point.topic.clone());
            values.push(value);
            value_strs.push(value_str);
            qualities.push(point.quality.code());
            metadata.push(metadata_json(point));
        }

        sqlx::query(INSERT_STATEMENT)
            .bind(&times)
            .bind(&topics)
            .bind(&values)
            .bind(&value_strs)
            .bind(&qualities)
            .bind(&metadata)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

fn is_copy_unsupported(e: &IngestError) -> bool {
    match e {
        IngestError::Database(sqlx::Error::Database(db)) => {
            // 0A000 feature_not_supported, 42601 syntax_error from
            // partial wire implementations.
            matches!(db.code().as_deref(), Some("0A000") | Some("42601"))
        }
        _ => false,
    }
}

/// Row timestamp: the point's server timestamp, else receive time, else
/// now.
fn row_time(point: &DataPoint) -> DateTime<Utc> {
    point
        .server_ts
        .or(point.received_at)
        .unwrap_or_else(Utc::now)
}

/// Split the tagged value into the store's `value FLOAT8 / value_str
/// TEXT` pair. The table constrains at least one to be non-null, so a
/// null value lands as an empty string.
fn split_value(point: &DataPoint) -> (Option<f64>, Option<String>) {
    match &point.value {
        Value::Text(s) => (None, Some(s.clone())),
        Value::Null => (None, Some(String::new())),
        v => (v.as_f64(), None),
    }
}

fn metadata_json(point: &DataPoint) -> Option<String> {
    let mut fields = serde_json::Map::new();
    if !point.device_id.is_empty() {
        fields.insert("dev".into(), point.device_id.clone().into());
    }
    if !point.tag_id.is_empty() {
        fields.insert("tag".into(), point.tag_id.clone().into());
    }
    if !point.unit.is_empty() {
        fields.insert("u".into(), point.unit.clone().into());
    }
    if let Some(src_ts) = point.source_ts {
        fields.insert("src_ts".into(), src_ts.timestamp_millis().into());
    }
    if fields.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(fields).to_string())
    }
}

// ---- binary COPY framing ----

const COPY_SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";

/// Microseconds between the Unix and PostgreSQL (2000-01-01) epochs.
fn pg_micros(ts: DateTime<Utc>) -> i64 {
    let pg_epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    (ts - pg_epoch).num_microseconds().unwrap_or(i64::MAX)
}

fn put_field(buf: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        Some(b) => {
            buf.extend_from_slice(&(b.len() as i32).to_be_bytes());
            buf.extend_from_slice(b);
        }
        None => buf.extend_from_slice(&(-1i32).to_be_bytes()),
    }
}

/// Encode a whole batch in the binary COPY format: signature, flags,
/// per-tuple field counts and big-endian fields, terminator.
pub fn encode_copy_rows(points: &[DataPoint]) -> Vec<u8> {
    // ~64 bytes per row is a comfortable overestimate for sizing.
    let mut buf = Vec::with_capacity(19 + points.len() * 96);
    buf.extend_from_slice(COPY_SIGNATURE);
    buf.extend_from_slice(&0i32.to_be_bytes()); // flags
    buf.extend_from_slice(&0i32.to_be_bytes()); // header extension length

    for point in points {
        buf.extend_from_slice(&6i16.to_be_bytes()); // field count

        put_field(&mut buf, Some(&pg_micros(row_time(point)).to_be_bytes()));
        put_field(&mut buf, Some(point.topic.as_bytes()));

        let (value, value_str) = split_value(point);
        match value {
            Some(v) => put_field(&mut buf, Some(&v.to_be_bytes())),
            None => put_field(&mut buf, None),
        }
        match &value_str {
            Some(s) => put_field(&mut buf, Some(s.as_bytes())),
            None => put_field(&mut buf, None),
        }

        put_field(&mut buf, Some(&point.quality.code().to_be_bytes()));

        match metadata_json(point) {
            Some(json) => put_field(&mut buf, Some(json.as_bytes())),
            None => put_field(&mut buf, None),
        }
    }

    buf.extend_from_slice(&(-1i16).to_be_bytes()); // trailer
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Quality;

    fn point(value: Value) -> DataPoint {
        DataPoint {
            topic: "acme/site1/plc-001/temperature".into(),
            device_id: "plc-001".into(),
            tag_id: "temperature".into(),
            value,
            quality: Quality::Good,
            unit: "°C".into(),
            source_ts: None,
            server_ts: Some(Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 1).unwrap()),
            received_at: None,
        }
    }

    #[test]
    fn copy_frame_has_signature_and_trailer() {
        let buf = encode_copy_rows(&[point(Value::Float(2.5))]);
        assert_eq!(&buf[..11], COPY_SIGNATURE);
        assert_eq!(&buf[11..19], &[0u8; 8]); // flags + extension
        assert_eq!(&buf[buf.len() - 2..], &(-1i16).to_be_bytes());
    }

    #[test]
    fn copy_row_layout() {
        let buf = encode_copy_rows(&[point(Value::Float(2.5))]);
        let mut at = 19;

        // Field count.
        assert_eq!(i16::from_be_bytes([buf[at], buf[at + 1]]), 6);
        at += 2;

        // time: 8-byte timestamptz, one second past the PG epoch.
        assert_eq!(i32::from_be_bytes(buf[at..at + 4].try_into().unwrap()), 8);
        at += 4;
        assert_eq!(
            i64::from_be_bytes(buf[at..at + 8].try_into().unwrap()),
            1_000_000
        );
        at += 8;

        // topic text.
        let topic_len =
            i32::from_be_bytes(buf[at..at + 4].try_into().unwrap()) as usize;
        at += 4;
        assert_eq!(&buf[at..at + topic_len], b"acme/site1/plc-001/temperature");
        at += topic_len;

        // value float8.
        assert_eq!(i32::from_be_bytes(buf[at..at + 4].try_into().unwrap()), 8);
        at += 4;
        assert_eq!(
            f64::from_be_bytes(buf[at..at + 8].try_into().unwrap()),
            2.5
        );
        at += 8;

        // value_str is NULL for numeric points.
        assert_eq!(i32::from_be_bytes(buf[at..at + 4].try_into().unwrap()), -1);
        at += 4;

        // quality int2 = 192.
        assert_eq!(i32::from_be_bytes(buf[at..at + 4].try_into().unwrap()), 2);
        at += 4;
        assert_eq!(i16::from_be_bytes([buf[at], buf[at + 1]]), 192);
    }

    #[test]
    fn string_points_use_value_str() {
        let (value, value_str) = split_value(&point(Value::Text("RUNNING".into())));
        assert!(value.is_none());
        assert_eq!(value_str.as_deref(), Some("RUNNING"));
    }

    #[test]
    fn null_points_satisfy_the_not_both_null_constraint() {
        let (value, value_str) = split_value(&point(Value::Null));
        assert!(value.is_none());
        assert_eq!(value_str.as_deref(), Some(""));
    }

    #[test]
    fn bools_are_stored_numerically() {
        let (value, value_str) = split_value(&point(Value::Bool(true)));
        assert_eq!(value, Some(1.0));
        assert!(value_str.is_none());
    }

    #[test]
    fn metadata_carries_identity_fields() {
        let json: serde_json::Value =
            serde_json::from_str(&metadata_json(&point(Value::Float(1.0))).unwrap()).unwrap();
        assert_eq!(json["dev"], "plc-001");
        assert_eq!(json["tag"], "temperature");
        assert_eq!(json["u"], "°C");
    }

    #[test]
    fn empty_metadata_becomes_null() {
        let mut p = point(Value::Float(1.0));
        p.device_id.clear();
        p.tag_id.clear();
        p.unit.clear();
        assert!(metadata_json(&p).is_none());
    }

    #[test]
    fn pg_epoch_conversion() {
        let unix_epoch = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        // 30 years of negative offset before the PG epoch.
        assert!(pg_micros(unix_epoch) < 0);
        let pg_epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(pg_micros(pg_epoch), 0);
    }
}
