//! Prometheus metrics for the gateway and the ingestion pipeline.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, CounterVec, Encoder, HistogramVec, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};

lazy_static! {
    // ---- gateway ----

    /// Points read from devices, including quality-annotated failures.
    pub static ref POINTS_READ: IntCounterVec = register_int_counter_vec!(
        "gateway_points_read_total",
        "Datapoints produced by device polls, by device and quality",
        &["device", "quality"]
    )
    .unwrap();

    pub static ref POINTS_PUBLISHED: IntCounter = register_int_counter!(
        "gateway_points_published_total",
        "Datapoints handed to the MQTT publisher"
    )
    .unwrap();

    pub static ref POLL_ERRORS: IntCounterVec = register_int_counter_vec!(
        "gateway_poll_errors_total",
        "Device poll cycles that failed",
        &["device"]
    )
    .unwrap();

    pub static ref POLL_DURATION: HistogramVec = register_histogram_vec!(
        "gateway_poll_duration_seconds",
        "Wall time of one device poll cycle",
        &["device"],
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();

    pub static ref PUBLISH_BUFFER_DEPTH: IntGauge = register_int_gauge!(
        "gateway_publish_buffer_depth",
        "Messages waiting in the offline publish buffer"
    )
    .unwrap();

    pub static ref PUBLISH_BUFFER_EVICTIONS: IntCounter = register_int_counter!(
        "gateway_publish_buffer_evictions_total",
        "Oldest-message evictions from the offline publish buffer"
    )
    .unwrap();

    pub static ref MQTT_CONNECTED: IntGauge = register_int_gauge!(
        "gateway_mqtt_connected",
        "1 while the broker session is up"
    )
    .unwrap();

    pub static ref COMMANDS: IntCounterVec = register_int_counter_vec!(
        "gateway_commands_total",
        "Write commands processed, by outcome",
        &["result"]
    )
    .unwrap();

    pub static ref COMMAND_DURATION: HistogramVec = register_histogram_vec!(
        "gateway_command_duration_seconds",
        "Write command round-trip time",
        &["device"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .unwrap();

    pub static ref POOL_CONNECTIONS: IntGaugeVec = register_int_gauge_vec!(
        "gateway_pool_connections",
        "Live connections per protocol pool",
        &["protocol"]
    )
    .unwrap();

    /// 0 = closed, 1 = open, 2 = half-open.
    pub static ref BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        "gateway_breaker_state",
        "Circuit breaker state per protocol pool",
        &["protocol"]
    )
    .unwrap();

    pub static ref CONNECTION_ERRORS: CounterVec = register_counter_vec!(
        "gateway_connection_errors_total",
        "Device connection failures",
        &["protocol", "device"]
    )
    .unwrap();

    // ---- ingestion ----

    pub static ref INGEST_RECEIVED: IntCounter = register_int_counter!(
        "ingest_points_received_total",
        "Datapoints parsed from broker messages"
    )
    .unwrap();

    pub static ref INGEST_DROPPED: IntCounter = register_int_counter!(
        "ingest_points_dropped_total",
        "Datapoints dropped on queue overflow"
    )
    .unwrap();

    pub static ref INGEST_WRITTEN: IntCounter = register_int_counter!(
        "ingest_points_written_total",
        "Datapoints persisted to the time-series store"
    )
    .unwrap();

    pub static ref INGEST_PARSE_ERRORS: IntCounter = register_int_counter!(
        "ingest_parse_errors_total",
        "Broker messages that failed to parse"
    )
    .unwrap();

    pub static ref INGEST_WRITE_ERRORS: IntCounter = register_int_counter!(
        "ingest_write_errors_total",
        "Batches abandoned after exhausting retries"
    )
    .unwrap();

    pub static ref INGEST_BATCH_RETRIES: IntCounter = register_int_counter!(
        "ingest_batch_retries_total",
        "Transient batch write failures that were retried"
    )
    .unwrap();

    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "ingest_queue_depth",
        "Datapoints waiting in the backpressure queue"
    )
    .unwrap();

    pub static ref BATCH_SIZE: HistogramVec = register_histogram_vec!(
        "ingest_batch_size",
        "Datapoints per flushed batch",
        &["trigger"],
        vec![10.0, 50.0, 100.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap();

    pub static ref DB_WRITE_LATENCY: HistogramVec = register_histogram_vec!(
        "ingest_db_write_duration_seconds",
        "Time taken to write one batch to the store",
        &["method"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .unwrap();

    pub static ref INGEST_MQTT_CONNECTED: IntGauge = register_int_gauge!(
        "ingest_mqtt_connected",
        "1 while the ingestion broker session is up"
    )
    .unwrap();

    pub static ref FLUSHES: IntCounterVec = register_int_counter_vec!(
        "ingest_flushes_total",
        "Batch flushes, by trigger",
        &["trigger"]
    )
    .unwrap();
}

/// Render the default registry in Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}
