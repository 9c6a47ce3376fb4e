//! Message-bus device
//!
//! The `MessageBus` is an in-process broadcast channel of topic/payload
//! messages and the entry point for external publishers. Castle has no broker
//! client of its own: whatever feeds the bus calls `attach_feeder` before the
//! system is built and then `publish`es MQTT-style messages. The binary ships
//! one such feeder, `bridge_json_lines`, which reads `{"topic", "payload"}`
//! lines from stdin and writes `…/set` messages to stdout.
//!
//! An `mqtt` device listens to `<api>/<id>` for its datapoints and writes
//! control values to `<api>/<id>/set`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use castle_types::{Datapoint, DatapointState, DeviceControlResponse, DeviceStatus, now_ms};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{state_from_json, state_to_json};

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: serde_json::Value,
}

pub struct MessageBus {
    sender: broadcast::Sender<BusMessage>,
    feeders: AtomicUsize,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BUS_CAPACITY)
    }
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            feeders: AtomicUsize::new(0),
        }
    }

    /// Announce an external publisher
    pub fn attach_feeder(&self) {
        self.feeders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn has_feeder(&self) -> bool {
        self.feeders.load(Ordering::Relaxed) > 0
    }

    /// Publish one `{"topic": .., "payload": ..}` JSON line
    pub fn publish_line(&self, line: &str) -> serde_json::Result<usize> {
        let message: BusMessage = serde_json::from_str(line)?;
        Ok(self.publish(message.topic, message.payload))
    }

    /// Publish a message; returns how many subscribers received it
    pub fn publish(&self, topic: impl Into<String>, payload: serde_json::Value) -> usize {
        self.sender
            .send(BusMessage {
                topic: topic.into(),
                payload,
            })
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON lines bridge
// ─────────────────────────────────────────────────────────────────────────────

/// Publish JSON lines from `reader` and write every `…/set` message to `writer`
///
/// Returns when `reader` reaches end of input.
pub async fn bridge_json_lines<R, W>(bus: Arc<MessageBus>, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut rx = bus.subscribe();
    let mut lines = reader.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Message bus input closed");
                    return Ok(());
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = bus.publish_line(line) {
                    warn!(error = %e, "Ignoring malformed bus message");
                }
            }
            message = rx.recv() => match message {
                Ok(message) if message.topic.ends_with("/set") => {
                    let mut out = serde_json::to_vec(&message).map_err(std::io::Error::other)?;
                    out.push(b'\n');
                    writer.write_all(&out).await?;
                    writer.flush().await?;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Bus bridge lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Device
// ─────────────────────────────────────────────────────────────────────────────

type Listeners = Arc<Mutex<Vec<mpsc::UnboundedSender<DatapointState>>>>;

pub struct MqttDevice {
    prefix: String,
    bus: Arc<MessageBus>,
    schema: Arc<HashMap<String, Datapoint>>,
    values: Arc<Mutex<HashMap<String, DatapointState>>>,
    listeners: Listeners,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttDevice {
    pub fn new(prefix: &str, bus: Arc<MessageBus>, schema: Vec<Datapoint>) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            bus,
            schema: Arc::new(schema.into_iter().map(|d| (d.id.clone(), d)).collect()),
            values: Arc::new(Mutex::new(HashMap::new())),
            listeners: Arc::new(Mutex::new(Vec::new())),
            task: Mutex::new(None),
        }
    }

    /// Start listening on the bus unless already listening
    fn ensure_listening(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let mut rx = self.bus.subscribe();
        let topic_prefix = format!("{}/", self.prefix);
        let schema = self.schema.clone();
        let values = self.values.clone();
        let listeners = self.listeners.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                let message = match rx.recv().await {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(prefix = %topic_prefix, skipped, "Message bus listener lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(id) = message.topic.strip_prefix(&topic_prefix) else {
                    continue;
                };
                let Some(dp) = schema.get(id) else {
                    continue;
                };
                let Some(state) = state_from_json(&dp.id, dp.value_type, now_ms(), &message.payload)
                else {
                    debug!(topic = %message.topic, "Ignoring unreadable payload");
                    continue;
                };
                values.lock().insert(dp.id.clone(), state.clone());
                listeners.lock().retain(|tx| tx.send(state.clone()).is_ok());
            }
        }));
    }

    pub async fn fetch(&self) -> DeviceStatus {
        self.ensure_listening();
        DeviceStatus::responsive(self.values.lock().clone())
    }

    /// Receive every new state as it arrives
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DatapointState> {
        self.ensure_listening();
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    pub async fn execute(&self, targets: &[(Datapoint, DatapointState)]) -> DeviceControlResponse {
        for (dp, state) in targets {
            let Some(payload) = state_to_json(dp.value_type, state) else {
                return DeviceControlResponse::failed(format!(
                    "no {} value for {}",
                    dp.value_type, dp.id
                ));
            };
            let topic = format!("{}/{}/set", self.prefix, dp.id);
            let receivers = self.bus.publish(topic.clone(), payload);
            debug!(topic = %topic, receivers, "Published control value");
        }
        DeviceControlResponse::ok()
    }

    pub async fn disconnect(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.listeners.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castle_types::ValueType;
    use serde_json::json;
    use std::time::Duration;

    fn device(bus: &Arc<MessageBus>) -> MqttDevice {
        MqttDevice::new(
            "garage/",
            bus.clone(),
            vec![
                Datapoint::new("door", "Door", ValueType::Boolean),
                Datapoint::new("temp", "Temperature", ValueType::Number),
            ],
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_values_are_cached_from_bus() {
        let bus = Arc::new(MessageBus::default());
        let device = device(&bus);
        assert!(device.fetch().await.datapoints.is_empty());

        bus.publish("garage/temp", json!(18.5));
        bus.publish("garage/door/set", json!(true));
        bus.publish("kitchen/temp", json!(22));
        settle().await;

        let status = device.fetch().await;
        assert!(status.responsive);
        assert_eq!(status.datapoints.len(), 1);
        assert_eq!(status.datapoints["temp"].value_num, Some(18.5));
    }

    #[tokio::test]
    async fn test_subscribers_receive_updates() {
        let bus = Arc::new(MessageBus::default());
        let device = device(&bus);
        let mut rx = device.subscribe();

        bus.publish("garage/door", json!("open"));
        bus.publish("garage/door", json!(1));

        let state = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.id, "door");
        assert_eq!(state.as_bool(), Some(true));

        device.disconnect().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_control_publishes_set_topic() {
        let bus = Arc::new(MessageBus::default());
        let device = device(&bus);
        let mut rx = bus.subscribe();

        let door = Datapoint::new("door", "Door", ValueType::Boolean);
        let response = device
            .execute(&[(door, DatapointState::boolean("door", 1, false))])
            .await;
        assert!(response.success);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "garage/door/set");
        assert_eq!(message.payload, json!(false));
    }

    #[test]
    fn test_publish_line() {
        let bus = MessageBus::default();
        assert!(!bus.has_feeder());
        bus.attach_feeder();
        assert!(bus.has_feeder());

        let mut rx = bus.subscribe();
        assert_eq!(bus.publish_line(r#"{"topic": "garage/temp", "payload": 4}"#).unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap().payload, json!(4));
        assert!(bus.publish_line("garage/temp 4").is_err());
    }

    #[tokio::test]
    async fn test_json_lines_bridge() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let bus = Arc::new(MessageBus::default());
        let device = device(&bus);
        device.fetch().await;

        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let bridge = tokio::spawn(bridge_json_lines(
            bus.clone(),
            BufReader::new(server_read),
            server_write,
        ));
        let (client_read, mut client_write) = tokio::io::split(client);
        settle().await;

        client_write
            .write_all(b"{\"topic\": \"garage/temp\", \"payload\": 21.5}\n\nnot json\n")
            .await
            .unwrap();
        settle().await;
        assert_eq!(device.fetch().await.datapoints["temp"].value_num, Some(21.5));

        let door = Datapoint::new("door", "Door", ValueType::Boolean);
        device
            .execute(&[(door, DatapointState::boolean("door", 1, true))])
            .await;
        let mut lines = BufReader::new(client_read).lines();
        let line = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let message: BusMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(message.topic, "garage/door/set");
        assert_eq!(message.payload, json!(true));

        client_write.shutdown().await.unwrap();
        bridge.await.unwrap().unwrap();
    }
}
