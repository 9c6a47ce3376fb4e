//! Datacollector part reading one device

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use castle_runtime::parts::{DatacollectorPart, PartError, PartResult, PushSink};
use castle_types::{Datapoint, DatapointState, EngineContext, ValueType};
use tracing::debug;

use super::DeviceInstance;

pub struct DeviceCollectorPart {
    name: String,
    device: Arc<DeviceInstance>,
    /// Public global ids to collect; everything when `None`
    datapoints: Option<HashSet<String>>,
}

impl DeviceCollectorPart {
    pub fn new(device: Arc<DeviceInstance>, datapoints: Option<Vec<String>>) -> Self {
        Self {
            name: format!("device:{}", device.id()),
            datapoints: datapoints.map(|d| d.into_iter().collect()),
            device,
        }
    }

    fn wants(&self, id: &str) -> bool {
        self.datapoints.as_ref().is_none_or(|d| d.contains(id))
    }

    fn datapoint(device: &DeviceInstance, id: &str) -> Datapoint {
        device
            .datapoint(id)
            .map(|d| d.datapoint.clone())
            .unwrap_or_else(|| Datapoint::new(id, id, ValueType::Number))
    }

    fn add(&self, updates: &mut EngineContext, id: &str, state: DatapointState) {
        if self.wants(id) {
            updates.set_datapoint(Self::datapoint(&self.device, id), state);
        }
    }
}

#[async_trait]
impl DatacollectorPart for DeviceCollectorPart {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, updates: &mut EngineContext) -> PartResult {
        let status = self.device.fetch_device_status().await;
        if !status.responsive {
            let error = status.error.unwrap_or_else(|| "unresponsive".to_string());
            return Err(PartError::new(format!("device {}: {error}", self.device.id())));
        }
        for (id, state) in status.datapoints {
            self.add(updates, &id, state);
        }
        Ok(())
    }

    fn register_push(&self, sink: PushSink) -> bool {
        if !self.device.capabilities().push {
            return false;
        }
        let Some(mut rx) = self.device.subscribe_push() else {
            return false;
        };

        let device = self.device.clone();
        let datapoints = self.datapoints.clone();
        tokio::spawn(async move {
            while let Some(state) = rx.recv().await {
                if datapoints.as_ref().is_some_and(|d| !d.contains(&state.id)) {
                    continue;
                }
                let mut update = EngineContext::new();
                update.set_datapoint(Self::datapoint(&device, &state.id), state);
                if sink.send(update).is_err() {
                    debug!(device = %device.id(), "Push sink closed");
                    break;
                }
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::devices::MessageBus;
    use serde_json::json;

    fn device(config: serde_json::Value, bus: &Arc<MessageBus>) -> Arc<DeviceInstance> {
        let config: DeviceConfig = serde_json::from_value(config).unwrap();
        Arc::new(DeviceInstance::new("dev", &config, bus).unwrap())
    }

    #[tokio::test]
    async fn test_collects_filtered_datapoints() {
        let bus = Arc::new(MessageBus::default());
        let sun = device(
            json!({ "type": "sim-solar", "settings": { "latitude": 52.5, "longitude": 13.4 } }),
            &bus,
        );
        let part = sun.make_datacollector_part(Some(vec!["daylight@dev".to_string()]));

        let mut updates = EngineContext::new();
        part.run(&mut updates).await.unwrap();
        let ids: Vec<&str> = updates.datapoint_ids().collect();
        assert_eq!(ids, vec!["daylight@dev"]);
        let entry = updates.get_datapoint("daylight@dev").unwrap();
        assert_eq!(entry.datapoint.value_type, ValueType::Boolean);
    }

    #[tokio::test]
    async fn test_unresponsive_device_is_a_part_error() {
        let bus = Arc::new(MessageBus::default());
        let file = device(json!({ "type": "sim-file", "api": "/nonexistent/series.json" }), &bus);
        let part = file.make_datacollector_part(None);

        let mut updates = EngineContext::new();
        let error = part.run(&mut updates).await.unwrap_err();
        assert!(error.0.starts_with("device dev: "));
        assert!(!updates.has_any_data());
    }

    #[tokio::test]
    async fn test_push_forwards_updates() {
        let bus = Arc::new(MessageBus::default());
        let mqtt = device(
            json!({
                "type": "mqtt",
                "api": "hall",
                "datapoints": [
                    { "id": "motion", "name": "Motion", "valueType": "boolean" },
                    { "id": "lux", "name": "Light", "valueType": "number" }
                ]
            }),
            &bus,
        );
        let part = mqtt.make_datacollector_part(Some(vec!["lux@dev".to_string()]));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        assert!(part.register_push(tx));

        bus.publish("hall/motion", json!(true));
        bus.publish("hall/lux", json!(320));
        let update = rx.recv().await.unwrap();
        let state = update.get_state("lux@dev").unwrap();
        assert_eq!(state.value_num, Some(320.0));
        assert!(update.get_state("motion@dev").is_none());
    }
}
