//! Device instance
//!
//! Binds one configured device to its driver and owns the id mappings of its
//! datapoints and control datapoints.

use std::collections::HashMap;
use std::sync::Arc;

use castle_types::{
    Datapoint, DatapointState, DeviceControlRequest, DeviceControlResponse, DeviceDatapoint,
    DeviceStatus,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::collector::DeviceCollectorPart;
use super::http::HttpJsonDevice;
use super::mapping::{DatapointIdMapping, MappedDatapoint, control_datapoints, device_datapoints};
use super::mqtt::{MessageBus, MqttDevice};
use super::simulation::{ConstantDevice, FileDevice, SecondsDevice};
use super::solar::SolarDevice;
use super::types::settings_of;
use super::{Capabilities, DeviceError, DeviceTypeKind};
use crate::config::DeviceConfig;

/// Transport of a device, one variant per device type
enum Driver {
    HttpJson(HttpJsonDevice),
    Mqtt(MqttDevice),
    SimConstant(ConstantDevice),
    SimSeconds(SecondsDevice),
    SimSolar(SolarDevice),
    SimFile(FileDevice),
}

impl Driver {
    fn new(
        id: &str,
        config: &DeviceConfig,
        schema: Vec<Datapoint>,
        bus: &Arc<MessageBus>,
    ) -> Result<Self, DeviceError> {
        let settings_error = |e: serde_json::Error| DeviceError::Settings {
            device: id.to_string(),
            message: e.to_string(),
        };
        let settings = &config.settings;

        Ok(match config.device_type {
            DeviceTypeKind::HttpJson => Driver::HttpJson(HttpJsonDevice::new(
                id,
                &config.api,
                settings_of(settings).map_err(settings_error)?,
                schema,
            )?),
            DeviceTypeKind::Mqtt => Driver::Mqtt(MqttDevice::new(&config.api, bus.clone(), schema)),
            DeviceTypeKind::SimConstant => {
                Driver::SimConstant(ConstantDevice::new(settings_of(settings).map_err(settings_error)?))
            }
            DeviceTypeKind::SimSeconds => Driver::SimSeconds(SecondsDevice),
            DeviceTypeKind::SimSolar => {
                Driver::SimSolar(SolarDevice::new(settings_of(settings).map_err(settings_error)?))
            }
            DeviceTypeKind::SimFile => Driver::SimFile(FileDevice::new(
                &config.api,
                settings_of(settings).map_err(settings_error)?,
            )),
        })
    }

    async fn fetch(&self) -> DeviceStatus {
        match self {
            Driver::HttpJson(d) => d.fetch().await,
            Driver::Mqtt(d) => d.fetch().await,
            Driver::SimConstant(d) => d.fetch().await,
            Driver::SimSeconds(d) => d.fetch().await,
            Driver::SimSolar(d) => d.fetch().await,
            Driver::SimFile(d) => d.fetch().await,
        }
    }

    async fn execute(&self, targets: &[(Datapoint, DatapointState)]) -> DeviceControlResponse {
        match self {
            Driver::HttpJson(d) => d.execute(targets).await,
            Driver::Mqtt(d) => d.execute(targets).await,
            Driver::SimConstant(d) => d.execute(targets).await,
            Driver::SimSeconds(_) | Driver::SimSolar(_) | Driver::SimFile(_) => {
                DeviceControlResponse::rejected("device type does not support control")
            }
        }
    }

    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<DatapointState>> {
        match self {
            Driver::Mqtt(d) => Some(d.subscribe()),
            _ => None,
        }
    }

    async fn disconnect(&self) {
        if let Driver::Mqtt(d) = self {
            d.disconnect().await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Instance
// ─────────────────────────────────────────────────────────────────────────────

pub struct DeviceInstance {
    id: String,
    name: String,
    kind: DeviceTypeKind,
    datapoints: Vec<MappedDatapoint>,
    control_datapoints: Vec<MappedDatapoint>,
    mapping: DatapointIdMapping,
    control_mapping: DatapointIdMapping,
    /// Public global id → index into `datapoints`
    by_public_id: HashMap<String, usize>,
    driver: Driver,
}

impl DeviceInstance {
    pub fn new(
        id: impl Into<String>,
        config: &DeviceConfig,
        bus: &Arc<MessageBus>,
    ) -> Result<Self, DeviceError> {
        let id = id.into();
        let kind = config.device_type;
        let datapoints = device_datapoints(&id, kind, config);
        let control_datapoints = control_datapoints(&id, kind, config);

        // Drivers read and write in private ids of both schemas
        let mut schema: Vec<Datapoint> = datapoints.iter().map(|d| d.private.clone()).collect();
        for control in &control_datapoints {
            if !schema.iter().any(|d| d.id == control.private.id) {
                schema.push(control.private.clone());
            }
        }
        let driver = Driver::new(&id, config, schema, bus)?;

        info!(
            device = %id,
            kind = %kind,
            datapoints = datapoints.len(),
            control_datapoints = control_datapoints.len(),
            "Device created"
        );

        Ok(Self {
            name: config.name.clone().unwrap_or_else(|| id.clone()),
            mapping: DatapointIdMapping::new(&datapoints),
            control_mapping: DatapointIdMapping::new(&control_datapoints),
            by_public_id: datapoints
                .iter()
                .enumerate()
                .map(|(i, d)| (d.public.datapoint.id.clone(), i))
                .collect(),
            id,
            kind,
            datapoints,
            control_datapoints,
            driver,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceTypeKind {
        self.kind
    }

    pub fn capabilities(&self) -> Capabilities {
        self.kind.capabilities()
    }

    pub fn datapoints(&self) -> impl Iterator<Item = &DeviceDatapoint> {
        self.datapoints.iter().map(|d| &d.public)
    }

    pub fn control_datapoints(&self) -> impl Iterator<Item = &DeviceDatapoint> {
        self.control_datapoints.iter().map(|d| &d.public)
    }

    /// Public datapoint by its global id
    pub fn datapoint(&self, global_id: &str) -> Option<&DeviceDatapoint> {
        self.by_public_id
            .get(global_id)
            .map(|&i| &self.datapoints[i].public)
    }

    /// Move a private state to its public global id
    fn publish_state(&self, private_id: String, state: DatapointState) -> (String, DatapointState) {
        match self.mapping.to_public(&private_id) {
            Some(public) => (public.to_string(), state.with_id(public)),
            None => (private_id, state),
        }
    }

    /// Fetch the device status under public global ids
    ///
    /// Ids the type reports outside of the schema pass through unmapped.
    pub async fn fetch_device_status(&self) -> DeviceStatus {
        let status = self.driver.fetch().await;
        DeviceStatus {
            datapoints: status
                .datapoints
                .into_iter()
                .map(|(id, state)| self.publish_state(id, state))
                .collect(),
            ..status
        }
    }

    /// Send targets addressed by public (global or local) ids to the device
    ///
    /// Targets that do not resolve to a control datapoint are dropped.
    pub async fn execute_control_request(
        &self,
        request: &DeviceControlRequest,
    ) -> DeviceControlResponse {
        if !self.capabilities().control {
            return DeviceControlResponse::rejected(format!(
                "device {} of type {} does not support control",
                self.id, self.kind
            ));
        }

        let mut resolved = Vec::with_capacity(request.targets.len());
        for target in &request.targets {
            let public_id = &target.target.datapoint_id;
            let private = self.control_mapping.to_private(public_id).and_then(|private| {
                self.control_datapoints
                    .iter()
                    .find(|d| d.private.id == private)
            });
            match private {
                Some(dp) => resolved.push((dp.private.clone(), target.state.with_id(&dp.private.id))),
                None => debug!(device = %self.id, datapoint = %public_id, "Dropping unresolved target"),
            }
        }
        if resolved.is_empty() && !request.targets.is_empty() {
            return DeviceControlResponse::rejected(format!(
                "no target resolves to a control datapoint of device {}",
                self.id
            ));
        }
        self.driver.execute(&resolved).await
    }

    /// Receive pushed states under public global ids
    pub fn subscribe_push(self: &Arc<Self>) -> Option<mpsc::UnboundedReceiver<DatapointState>> {
        let mut private_rx = self.driver.subscribe()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let device = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(state) = private_rx.recv().await {
                let Some(device) = device.upgrade() else {
                    break;
                };
                let (_, state) = device.publish_state(state.id.clone(), state);
                if tx.send(state).is_err() {
                    break;
                }
            }
        });
        Some(rx)
    }

    /// Collector part reading this device
    ///
    /// `datapoints` limits the collected public global ids.
    pub fn make_datacollector_part(
        self: &Arc<Self>,
        datapoints: Option<Vec<String>>,
    ) -> DeviceCollectorPart {
        DeviceCollectorPart::new(self.clone(), datapoints)
    }

    pub async fn disconnect(&self) {
        debug!(device = %self.id, "Disconnecting device");
        self.driver.disconnect().await;
    }
}
