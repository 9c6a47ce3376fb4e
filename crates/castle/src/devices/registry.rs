//! Device registry
//!
//! All device instances of a system by id. Control engines reach devices
//! through the registry.

use std::sync::Arc;

use async_trait::async_trait;
use castle_runtime::DeviceController;
use castle_types::{DeviceControlRequest, DeviceControlResponse};
use dashmap::DashMap;
use tracing::{debug, warn};

use super::DeviceInstance;

#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, Arc<DeviceInstance>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: Arc<DeviceInstance>) {
        let id = device.id().to_string();
        if self.devices.insert(id.clone(), device).is_some() {
            warn!(device = %id, "Replaced device instance");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<DeviceInstance>> {
        self.devices.get(id).map(|d| d.value().clone())
    }

    /// Device ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.iter().map(|d| d.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub async fn disconnect_all(&self) {
        // Collect first; no map guard may be held across an await
        let devices: Vec<Arc<DeviceInstance>> =
            self.devices.iter().map(|d| d.value().clone()).collect();
        for device in devices {
            device.disconnect().await;
        }
    }
}

#[async_trait]
impl DeviceController for DeviceRegistry {
    async fn execute_control_request(
        &self,
        device_id: &str,
        request: &DeviceControlRequest,
    ) -> DeviceControlResponse {
        let Some(device) = self.get(device_id) else {
            debug!(device = %device_id, "Control request for unknown device");
            return DeviceControlResponse::rejected(format!("unknown device {device_id}"));
        };
        device.execute_control_request(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::devices::MessageBus;
    use castle_types::{DatapointState, DatapointTarget, TargetSpec, TargetTiming};

    fn registry() -> DeviceRegistry {
        let config: DeviceConfig =
            serde_json::from_value(serde_json::json!({ "type": "sim-constant" })).unwrap();
        let bus = Arc::new(MessageBus::default());
        let registry = DeviceRegistry::new();
        for id in ["b", "a"] {
            registry.insert(Arc::new(DeviceInstance::new(id, &config, &bus).unwrap()));
        }
        registry
    }

    #[test]
    fn test_ids_are_sorted() {
        let registry = registry();
        assert_eq!(registry.ids(), vec!["a", "b"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("c").is_none());
    }

    #[tokio::test]
    async fn test_control_dispatch() {
        let registry = registry();
        let request = DeviceControlRequest {
            targets: vec![DatapointTarget {
                target: TargetSpec::new("a", "value@a"),
                state: DatapointState::number("value@a", 1, 3.0),
                when: TargetTiming::PartEnd,
            }],
        };

        let response = registry.execute_control_request("a", &request).await;
        assert!(response.success);
        let status = registry.get("a").unwrap().fetch_device_status().await;
        assert_eq!(status.datapoints["value@a"].value_num, Some(3.0));

        let response = registry.execute_control_request("zz", &request).await;
        assert_eq!(response, DeviceControlResponse::rejected("unknown device zz"));
        assert!(!response.executed);
    }
}
