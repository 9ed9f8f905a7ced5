//! Write-command dispatch.
//!
//! Two inbound shapes share one code path: `$nexus/cmd/{device}/write`
//! with a JSON body (`{request_id?, tag_id, value}`) and
//! `$nexus/cmd/{device}/{tag}/set` with a bare JSON value. Every accepted
//! command produces a response on `$nexus/cmd/response/{device}/{tag}`
//! within the write timeout, success or not; silence within the timeout
//! is itself a diagnostic. Commands run concurrently up to the
//! configured limit.

use crate::error::{GatewayError, GatewayResult};
use crate::metrics;
use crate::model::{Value, WriteCommand, WriteResponse};
use crate::mqtt::publisher::MqttPublisher;
use crate::mqtt::CMD_RESPONSE_PREFIX;
use crate::pool::PoolManager;
use crate::registry::DeviceRegistry;
use rumqttc::{Publish, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Parse a command topic + payload into the uniform write command. The
/// device id always comes from the topic; for the `/set` shape so does
/// the tag id.
pub fn parse_command(topic: &str, payload: &[u8]) -> GatewayResult<WriteCommand> {
    let segments: Vec<&str> = topic.split('/').collect();
    match segments.as_slice() {
        ["$nexus", "cmd", device_id, "write"] => {
            let mut command: WriteCommand = serde_json::from_slice(payload)
                .map_err(|e| GatewayError::MalformedCommand(e.to_string()))?;
            command.device_id = device_id.to_string();
            if command.tag_id.is_empty() {
                return Err(GatewayError::MalformedCommand("missing tag_id".into()));
            }
            Ok(command)
        }
        ["$nexus", "cmd", device_id, tag_id, "set"] => {
            let raw: serde_json::Value = serde_json::from_slice(payload)
                .map_err(|e| GatewayError::MalformedCommand(e.to_string()))?;
            if raw.is_array() || raw.is_object() {
                return Err(GatewayError::MalformedCommand(
                    "set payload must be a scalar value".into(),
                ));
            }
            Ok(WriteCommand {
                request_id: None,
                device_id: device_id.to_string(),
                tag_id: tag_id.to_string(),
                value: Value::from_json(&raw),
            })
        }
        _ => Err(GatewayError::MalformedCommand(format!(
            "not a command topic: {}",
            topic
        ))),
    }
}

/// Device id out of a command topic, for error responses to commands
/// whose body failed to parse.
fn device_from_topic(topic: &str) -> Option<&str> {
    let segments: Vec<&str> = topic.split('/').collect();
    match segments.as_slice() {
        ["$nexus", "cmd", device_id, "write"] => Some(device_id),
        ["$nexus", "cmd", device_id, _, "set"] => Some(device_id),
        _ => None,
    }
}

fn tag_from_topic(topic: &str) -> Option<&str> {
    let segments: Vec<&str> = topic.split('/').collect();
    match segments.as_slice() {
        ["$nexus", "cmd", _, tag_id, "set"] => Some(tag_id),
        _ => None,
    }
}

pub struct CommandHandler {
    registry: Arc<DeviceRegistry>,
    pools: Arc<PoolManager>,
    publisher: Arc<MqttPublisher>,
    write_timeout: Duration,
    limiter: Arc<Semaphore>,
}

impl CommandHandler {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        pools: Arc<PoolManager>,
        publisher: Arc<MqttPublisher>,
        write_timeout: Duration,
        max_concurrent_writes: usize,
    ) -> Arc<Self> {
        Arc::new(CommandHandler {
            registry,
            pools,
            publisher,
            write_timeout,
            limiter: Arc::new(Semaphore::new(max_concurrent_writes)),
        })
    }

    /// Handle one inbound command message on its own task, bounded by the
    /// concurrency limiter.
    pub fn spawn_handle(self: &Arc<Self>, publish: Publish) {
        let handler = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = handler.limiter.clone().acquire_owned().await else {
                return;
            };
            handler.handle(&publish).await;
        });
    }

    pub async fn handle(&self, publish: &Publish) {
        let topic = publish.topic.clone();
        let started = Instant::now();

        let command = match parse_command(&topic, &publish.payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(topic = %topic, error = %e, "rejected malformed command");
                metrics::COMMANDS.with_label_values(&["malformed"]).inc();
                // Respond when the topic at least names a device.
                if let Some(device_id) = device_from_topic(&topic) {
                    let tag_id = tag_from_topic(&topic).unwrap_or("unknown");
                    let response = WriteResponse::err(None, e.to_string(), elapsed_ms(started));
                    self.respond(device_id, tag_id, &response).await;
                }
                return;
            }
        };

        let response = self.execute(&command, started).await;
        let result_label = if response.success { "ok" } else { "error" };
        metrics::COMMANDS.with_label_values(&[result_label]).inc();
        metrics::COMMAND_DURATION
            .with_label_values(&[&command.device_id])
            .observe(started.elapsed().as_secs_f64());
        self.respond(&command.device_id, &command.tag_id, &response)
            .await;
    }

    /// Validate and execute one write. Always returns a response object.
    async fn execute(&self, command: &WriteCommand, started: Instant) -> WriteResponse {
        let request_id = command.request_id.clone();

        let Some(device) = self.registry.get(&command.device_id).await else {
            return WriteResponse::err(
                request_id,
                format!("unknown device: {}", command.device_id),
                elapsed_ms(started),
            );
        };
        let Some(tag) = device.find_tag(&command.tag_id) else {
            return WriteResponse::err(
                request_id,
                format!("unknown tag: {}", command.tag_id),
                elapsed_ms(started),
            );
        };
        // Reject read-only tags before any device I/O.
        if !tag.is_writable() {
            return WriteResponse::err(request_id, "tag is not writable", elapsed_ms(started));
        }

        debug!(
            device = %command.device_id,
            tag = %command.tag_id,
            value = %command.value,
            "executing write command"
        );

        match tokio::time::timeout(
            self.write_timeout,
            self.pools.write_tag(&device, tag, &command.value),
        )
        .await
        {
            Ok(Ok(())) => WriteResponse::ok(request_id, elapsed_ms(started)),
            Ok(Err(e)) => WriteResponse::err(request_id, e.to_string(), elapsed_ms(started)),
            Err(_) => WriteResponse::err(request_id, "write timed out", elapsed_ms(started)),
        }
    }

    async fn respond(&self, device_id: &str, tag_id: &str, response: &WriteResponse) {
        let topic = format!("{}/{}/{}", CMD_RESPONSE_PREFIX, device_id, tag_id);
        let payload = match serde_json::to_vec(response) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize write response");
                return;
            }
        };
        self.publisher
            .publish(&topic, QoS::AtLeastOnce, payload)
            .await;
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::config::{MqttConfig, PoolSettings};
    use crate::model::{
        AccessMode, ByteOrder, ConnectionParams, DataType, Device, Protocol, Tag,
    };
    use crate::pool::ConnectionPool;
    use crate::protocols::testutil::ScriptedClient;
    use crate::protocols::ProtocolClient;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    fn tag(id: &str, access: AccessMode) -> Tag {
        Tag {
            id: id.to_string(),
            name: String::new(),
            address: "40001".into(),
            data_type: DataType::Float32,
            register_type: None,
            byte_order: ByteOrder::BigEndian,
            bit: None,
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
            access,
            enabled: true,
            topic_suffix: id.to_string(),
            deadband: None,
        }
    }

    fn device() -> Device {
        Device {
            id: "plc-001".into(),
            name: String::new(),
            protocol: Protocol::ModbusTcp,
            connection: ConnectionParams {
                endpoint: "127.0.0.1:502".into(),
                unit_id: Some(1),
                baud_rate: None,
                rack: None,
                slot: None,
                security_policy: None,
                security_mode: None,
                username: None,
                password: None,
                cert_path: None,
                key_path: None,
                connect_timeout_ms: 200,
            },
            poll_interval_ms: 1000,
            uns_prefix: "acme/site1/plc-001".into(),
            enabled: true,
            tags: vec![
                tag("setpoint", AccessMode::ReadWrite),
                tag("temperature", AccessMode::Read),
            ],
        }
    }

    type WriteLog = Arc<Mutex<Vec<(String, Value)>>>;

    async fn harness() -> (Arc<CommandHandler>, Arc<MqttPublisher>, WriteLog) {
        let writes: WriteLog = Arc::new(Mutex::new(Vec::new()));
        let writes_for_factory = writes.clone();

        let pool = ConnectionPool::with_factory(
            Protocol::ModbusTcp,
            PoolSettings::default(),
            CircuitBreaker::new("test", BreakerConfig::default()),
            Box::new(move |dev| {
                let mut client = ScriptedClient::new(&dev.id, vec![]);
                client.writes = writes_for_factory.clone();
                Ok(Box::new(client) as Box<dyn ProtocolClient>)
            }),
        );
        let pools = Arc::new(PoolManager::with_pool_for_tests(Protocol::ModbusTcp, pool));

        let registry = Arc::new(DeviceRegistry::new());
        let publisher = MqttPublisher::start(
            &MqttConfig {
                broker_url: "mqtt://127.0.0.1:1".into(),
                client_id: "cmd-test".into(),
                reconnect_base_secs: 60,
                ..Default::default()
            },
            None,
            CancellationToken::new(),
        )
        .unwrap();

        let handler = CommandHandler::new(
            registry.clone(),
            pools,
            publisher.clone(),
            Duration::from_millis(500),
            4,
        );
        registry.load(vec![device()]).await;
        (handler, publisher, writes)
    }

    fn publish(topic: &str, payload: &[u8]) -> Publish {
        Publish::new(topic, QoS::AtLeastOnce, payload.to_vec())
    }

    fn parse_response(publisher: &MqttPublisher) -> (String, serde_json::Value) {
        let parked = publisher.parked_messages();
        assert_eq!(parked.len(), 1, "expected exactly one response");
        let (topic, payload) = parked.into_iter().next().unwrap();
        (topic, serde_json::from_slice(&payload).unwrap())
    }

    #[test]
    fn parse_json_write_command() {
        let cmd = parse_command(
            "$nexus/cmd/plc-001/write",
            br#"{"request_id": "r-1", "tag_id": "setpoint", "value": 75.5}"#,
        )
        .unwrap();
        assert_eq!(cmd.device_id, "plc-001");
        assert_eq!(cmd.tag_id, "setpoint");
        assert_eq!(cmd.request_id.as_deref(), Some("r-1"));
        assert_eq!(cmd.value, Value::Float(75.5));
    }

    #[test]
    fn parse_raw_set_command() {
        let cmd = parse_command("$nexus/cmd/plc-001/setpoint/set", b"75.5").unwrap();
        assert_eq!(cmd.device_id, "plc-001");
        assert_eq!(cmd.tag_id, "setpoint");
        assert!(cmd.request_id.is_none());
        assert_eq!(cmd.value, Value::Float(75.5));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(parse_command("$nexus/cmd/plc-001/write", b"{not json").is_err());
        assert!(parse_command("$nexus/cmd/plc-001/setpoint/set", b"[1,2]").is_err());
        assert!(parse_command("$nexus/status/plc-001", b"1").is_err());
        assert!(parse_command("$nexus/cmd/plc-001/write", br#"{"value": 1}"#).is_err());
    }

    #[tokio::test]
    async fn successful_write_responds_and_reaches_device() {
        let (handler, publisher, writes) = harness().await;

        handler
            .handle(&publish("$nexus/cmd/plc-001/setpoint/set", b"75.5"))
            .await;

        let (topic, response) = parse_response(&publisher);
        assert_eq!(topic, "$nexus/cmd/response/plc-001/setpoint");
        assert_eq!(response["success"], true);
        assert!(response["duration_ms"].is_u64());

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "setpoint");
        assert_eq!(writes[0].1, Value::Float(75.5));
    }

    #[tokio::test]
    async fn read_only_tag_rejected_without_io() {
        let (handler, publisher, writes) = harness().await;

        handler
            .handle(&publish("$nexus/cmd/plc-001/temperature/set", b"20.0"))
            .await;

        let (topic, response) = parse_response(&publisher);
        assert_eq!(topic, "$nexus/cmd/response/plc-001/temperature");
        assert_eq!(response["success"], false);
        assert_eq!(response["error"], "tag is not writable");
        assert!(writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_device_and_tag_get_error_responses() {
        let (handler, publisher, _) = harness().await;

        handler
            .handle(&publish("$nexus/cmd/plc-404/setpoint/set", b"1"))
            .await;
        let (_, response) = parse_response(&publisher);
        assert_eq!(response["success"], false);
        assert!(response["error"]
            .as_str()
            .unwrap()
            .contains("unknown device"));
    }

    #[tokio::test]
    async fn malformed_json_still_gets_a_response() {
        let (handler, publisher, _) = harness().await;

        handler
            .handle(&publish("$nexus/cmd/plc-001/write", b"{broken"))
            .await;
        let (topic, response) = parse_response(&publisher);
        assert_eq!(topic, "$nexus/cmd/response/plc-001/unknown");
        assert_eq!(response["success"], false);
    }

    #[tokio::test]
    async fn request_id_round_trips() {
        let (handler, publisher, _) = harness().await;

        handler
            .handle(&publish(
                "$nexus/cmd/plc-001/write",
                br#"{"request_id": "abc-123", "tag_id": "setpoint", "value": 1.0}"#,
            ))
            .await;
        let (_, response) = parse_response(&publisher);
        assert_eq!(response["request_id"], "abc-123");
    }
}
