//! System Orchestrator
//!
//! `CastleAcDc` builds everything a configuration describes and wires the
//! engines into the lap pipeline:
//!
//! ```text
//! devices → collectors → datastate → controls → devices
//!                             ↘           ↘
//!                              persists ←── (control laps)
//! ```
//!
//! Building never fails on bad entries: every problem is recorded, the entry
//! is left out and the rest of the system runs. A system with problems is
//! reported as invalid.

mod handle;

pub use handle::SystemHandle;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use castle_runtime::control::{ActionControl, ControlSettings, FreezersControl, LapOutcome};
use castle_runtime::datacollector::DatacollectorSettings;
use castle_runtime::datastate::{CalculatorPart, MapperPart, SequencerPart};
use castle_runtime::engine::{ContextConsumer, ControlConsumer, EngineSnapshot};
use castle_runtime::expression::{DatapointCalculator, ExpressionEngine};
use castle_runtime::parts::{
    ContextPersistPart, ControlAction, ControlPart, ControlPersistPart, DatacollectorPart,
    DatastatePart,
};
use castle_runtime::{
    ControlEngine, DatacollectorEngine, DatastateEngine, DeviceController, Engine, EngineError,
    PersistEngine,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{
    ConfigDocument, ConfigError, ControlConfig, ControlPartConfig, DATASTATE_KEY, MailConfig,
    PersistConfig, PersistenceConfig, StateConfig, ValidConfig, load_config, validate,
};
use crate::devices::{DeviceInstance, DeviceRegistry, DeviceTypeKind, MessageBus};
use crate::mail::{LogMailSender, MailSender};
use crate::persistence::{MemoryPersistence, Persistence, PersistenceEngine, RedbPersistence};

// ─────────────────────────────────────────────────────────────────────────────
// System Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    #[error("Engine {0} does not take actions")]
    NotAControl(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to {action} engines: {}", errors.join("; "))]
    Lifecycle {
        action: &'static str,
        errors: Vec<String>,
    },
}

pub type SystemResult<T> = Result<T, SystemError>;

/// Serializable overview of a running system
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub name: String,
    pub valid: bool,
    pub errors: Vec<String>,
    pub devices: Vec<String>,
    pub engines: Vec<EngineSnapshot>,
}

// ─────────────────────────────────────────────────────────────────────────────
// CastleAcDc
// ─────────────────────────────────────────────────────────────────────────────

pub struct CastleAcDc {
    document: ConfigDocument,
    config: ValidConfig,
    errors: Vec<String>,
    bus: Arc<MessageBus>,
    devices: Arc<DeviceRegistry>,
    persistence: BTreeMap<String, Arc<PersistenceEngine>>,
    mail: BTreeMap<String, Arc<dyn MailSender>>,
    collectors: BTreeMap<String, Arc<DatacollectorEngine>>,
    datastate: Option<Arc<DatastateEngine>>,
    controls: BTreeMap<String, Arc<ControlEngine>>,
    persists: BTreeMap<String, Arc<PersistEngine>>,
}

impl CastleAcDc {
    /// Load, validate and build the system described by a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> SystemResult<Self> {
        Self::from_file_with_bus(path, Arc::new(MessageBus::default()))
    }

    /// Like `from_file`, with message-bus devices attached to `bus`
    pub fn from_file_with_bus(path: impl AsRef<Path>, bus: Arc<MessageBus>) -> SystemResult<Self> {
        let document = load_config(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Configuration loaded");
        Ok(Self::build_with_bus(document, bus))
    }

    /// Validate `document` and build everything that passed
    ///
    /// Must be called inside a tokio runtime; push-capable devices spawn
    /// their forwarding tasks while the collectors are built.
    pub fn build(document: ConfigDocument) -> Self {
        Self::build_with_bus(document, Arc::new(MessageBus::default()))
    }

    pub fn build_with_bus(document: ConfigDocument, bus: Arc<MessageBus>) -> Self {
        let config = validate(&document);
        let mut system = Self {
            errors: config.errors.clone(),
            bus,
            devices: Arc::new(DeviceRegistry::new()),
            persistence: BTreeMap::new(),
            mail: BTreeMap::new(),
            collectors: BTreeMap::new(),
            datastate: None,
            controls: BTreeMap::new(),
            persists: BTreeMap::new(),
            document,
            config,
        };

        system.build_persistence_and_mail();
        system.build_devices();
        system.build_collectors();
        system.build_datastate();
        system.build_controls();
        system.build_persists();

        if system.errors.is_empty() {
            info!(
                system = %system.config.system.name,
                devices = system.devices.len(),
                collectors = system.collectors.len(),
                controls = system.controls.len(),
                persists = system.persists.len(),
                "System built"
            );
        } else {
            warn!(
                system = %system.config.system.name,
                errors = system.errors.len(),
                "System built with configuration errors"
            );
        }
        system
    }

    fn build_persistence_and_mail(&mut self) {
        for (id, config) in &self.config.persistence {
            let backend: Arc<dyn Persistence> = match config {
                PersistenceConfig::Memory { max_rows } => {
                    Arc::new(MemoryPersistence::new(id.clone(), *max_rows))
                }
                PersistenceConfig::Redb { path } => {
                    Arc::new(RedbPersistence::new(id.clone(), path.clone()))
                }
            };
            self.persistence
                .insert(id.clone(), Arc::new(PersistenceEngine::new(id.clone(), backend)));
        }
        for (id, config) in &self.config.mail {
            let sender: Arc<dyn MailSender> = match config {
                MailConfig::Log { .. } => Arc::new(LogMailSender::from_config(id, config)),
            };
            self.mail.insert(id.clone(), sender);
        }
    }

    fn build_devices(&mut self) {
        for (id, config) in &self.config.devices {
            if config.device_type == DeviceTypeKind::Mqtt && !self.bus.has_feeder() {
                warn!(
                    device = %id,
                    "No publisher is attached to the message bus; the device will not receive data"
                );
            }
            match DeviceInstance::new(id, config, &self.bus) {
                Ok(device) => self.devices.insert(Arc::new(device)),
                Err(e) => {
                    error!(device = %id, error = %e, "Failed to create device");
                    self.errors.push(format!("devices.{id}: {e}"));
                }
            }
        }
    }

    fn build_collectors(&mut self) {
        for (id, config) in &self.config.collectors {
            let mut parts: Vec<Arc<dyn DatacollectorPart>> = Vec::new();
            for source in &config.sources {
                match self.devices.get(&source.device_id) {
                    Some(device) => {
                        parts.push(Arc::new(device.make_datacollector_part(source.datapoints.clone())))
                    }
                    None => self.errors.push(format!(
                        "engines.{id}: device '{}' is not available",
                        source.device_id
                    )),
                }
            }
            let settings = DatacollectorSettings {
                lap_duration: config.lap_duration,
            };
            self.collectors.insert(
                id.clone(),
                Arc::new(DatacollectorEngine::new(id.clone(), settings, parts)),
            );
        }
    }

    fn build_datastate(&mut self) {
        let Some(config) = &self.config.datastate else {
            return;
        };

        let expressions = Arc::new(ExpressionEngine::new());
        let mut calculators = Vec::new();
        for calculator in &config.calculators {
            match DatapointCalculator::new(
                Arc::clone(&expressions),
                calculator.datapoint.clone(),
                &calculator.code,
            ) {
                Ok(calculator) => calculators.push(calculator),
                Err(e) => self.errors.push(format!(
                    "engines.{DATASTATE_KEY}: calculator '{}': {e}",
                    calculator.datapoint.id
                )),
            }
        }

        let parts: Vec<Box<dyn DatastatePart>> = vec![
            Box::new(MapperPart::new("mapper", config.mappings.clone())),
            Box::new(CalculatorPart::new("calculator", calculators)),
            Box::new(SequencerPart::new("sequencer", config.sequences.clone())),
        ];
        let datastate = Arc::new(DatastateEngine::new(DATASTATE_KEY, parts));

        let consumer: Arc<dyn ContextConsumer> = datastate.clone();
        for collector in self.sources_of_datastate(config) {
            collector.subscribe(Arc::clone(&consumer));
        }
        self.datastate = Some(datastate);
    }

    fn sources_of_datastate(&self, config: &StateConfig) -> Vec<Arc<DatacollectorEngine>> {
        if config.sources.is_empty() {
            return self.collectors.values().cloned().collect();
        }
        config
            .sources
            .iter()
            .filter_map(|id| self.collectors.get(id).cloned())
            .collect()
    }

    fn build_controls(&mut self) {
        let controller: Arc<dyn DeviceController> = self.devices.clone();
        for (id, config) in &self.config.controls {
            let parts = Self::control_parts(config);
            let settings = ControlSettings {
                max_history: config.max_history,
            };
            let control = Arc::new(ControlEngine::new(
                id.clone(),
                settings,
                parts,
                Arc::clone(&controller),
            ));
            self.subscribe_to_contexts(&config.sources, control.clone());
            self.controls.insert(id.clone(), control);
        }
    }

    fn control_parts(config: &ControlConfig) -> Vec<Box<dyn ControlPart>> {
        config
            .parts
            .iter()
            .enumerate()
            .map(|(index, part)| -> Box<dyn ControlPart> {
                let name = part.name(index);
                match part {
                    ControlPartConfig::Freezers { settings, .. } => {
                        Box::new(FreezersControl::new(name, settings.clone()))
                    }
                    ControlPartConfig::Actions { actions, .. } => {
                        Box::new(ActionControl::new(name, actions.clone()))
                    }
                }
            })
            .collect()
    }

    /// Subscribe `consumer` to the context producing engines in `sources`
    ///
    /// No sources means the datastate, or every collector when there is no
    /// datastate.
    fn subscribe_to_contexts(&self, sources: &[String], consumer: Arc<dyn ContextConsumer>) {
        if sources.is_empty() {
            match &self.datastate {
                Some(datastate) => datastate.subscribe(consumer),
                None => {
                    for collector in self.collectors.values() {
                        collector.subscribe(Arc::clone(&consumer));
                    }
                }
            }
            return;
        }
        for source in sources {
            if source == DATASTATE_KEY {
                if let Some(datastate) = &self.datastate {
                    datastate.subscribe(Arc::clone(&consumer));
                }
            } else if let Some(collector) = self.collectors.get(source) {
                collector.subscribe(Arc::clone(&consumer));
            }
        }
    }

    fn build_persists(&mut self) {
        for (id, config) in &self.config.persists {
            let Some(persistence) = self.persistence.get(&config.persistence) else {
                continue;
            };

            let mut context_parts: Vec<Arc<dyn ContextPersistPart>> = Vec::new();
            if let Some(log) = &config.datapoint_log {
                context_parts.push(Arc::new(persistence.make_datapoint_log_part(&log.ids)));
            }
            if let Some(sample) = &config.sample_log {
                context_parts.push(Arc::new(persistence.make_sample_log_part(sample)));
            }
            let mut control_parts: Vec<Arc<dyn ControlPersistPart>> = Vec::new();
            if config.control_log {
                control_parts.push(Arc::new(persistence.make_control_log_part()));
            }

            let persist = Arc::new(PersistEngine::new(id.clone(), context_parts, control_parts));
            self.wire_persist(config, &persist);
            self.persists.insert(id.clone(), persist);
        }
    }

    fn wire_persist(&self, config: &PersistConfig, persist: &Arc<PersistEngine>) {
        let contexts: Arc<dyn ContextConsumer> = persist.clone();
        let controls: Arc<dyn ControlConsumer> = persist.clone();

        if config.sources.is_empty() {
            if config.datapoint_log.is_some() || config.sample_log.is_some() {
                self.subscribe_to_contexts(&[], contexts);
            }
            if config.control_log {
                for control in self.controls.values() {
                    control.subscribe_lap_end(Arc::clone(&controls));
                }
            }
            return;
        }

        let (control_sources, context_sources): (Vec<String>, Vec<String>) = config
            .sources
            .iter()
            .cloned()
            .partition(|source| self.controls.contains_key(source));
        if !context_sources.is_empty() {
            self.subscribe_to_contexts(&context_sources, contexts);
        }
        for source in control_sources {
            if let Some(control) = self.controls.get(&source) {
                control.subscribe_lap_end(Arc::clone(&controls));
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.config.system.name
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Configuration and build problems
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn document(&self) -> &ConfigDocument {
        &self.document
    }

    pub fn auto_start(&self) -> bool {
        self.config.system.auto_start
    }

    /// Where external publishers deliver messages for `mqtt` devices
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn collector(&self, id: &str) -> Option<&Arc<DatacollectorEngine>> {
        self.collectors.get(id)
    }

    pub fn datastate(&self) -> Option<&Arc<DatastateEngine>> {
        self.datastate.as_ref()
    }

    pub fn control(&self, id: &str) -> Option<&Arc<ControlEngine>> {
        self.controls.get(id)
    }

    pub fn persistence(&self, id: &str) -> Option<&Arc<PersistenceEngine>> {
        self.persistence.get(id)
    }

    pub fn mail_sender(&self, id: &str) -> Option<&Arc<dyn MailSender>> {
        self.mail.get(id)
    }

    /// Any engine by its key
    pub fn engine(&self, id: &str) -> Option<Arc<dyn Engine>> {
        self.all_engines()
            .into_iter()
            .find(|(engine, _)| engine.key() == id)
            .map(|(engine, _)| engine)
    }

    /// Engines in start order, with their auto start flag
    fn all_engines(&self) -> Vec<(Arc<dyn Engine>, bool)> {
        let mut engines: Vec<(Arc<dyn Engine>, bool)> = Vec::new();
        for engine in self.persistence.values() {
            engines.push((engine.clone(), true));
        }
        for (id, engine) in &self.persists {
            engines.push((engine.clone(), self.config.persists[id].auto_start));
        }
        for (id, engine) in &self.controls {
            engines.push((engine.clone(), self.config.controls[id].auto_start));
        }
        if let (Some(engine), Some(config)) = (&self.datastate, &self.config.datastate) {
            engines.push((engine.clone(), config.auto_start));
        }
        for (id, engine) in &self.collectors {
            engines.push((engine.clone(), self.config.collectors[id].auto_start));
        }
        engines
    }

    /// Engines in stop order: collectors, controls, datastate, persists, persistence
    fn engines_in_stop_order(&self) -> Vec<Arc<dyn Engine>> {
        let mut engines: Vec<Arc<dyn Engine>> = Vec::new();
        engines.extend(self.collectors.values().map(|e| e.clone() as Arc<dyn Engine>));
        engines.extend(self.controls.values().map(|e| e.clone() as Arc<dyn Engine>));
        engines.extend(self.datastate.iter().map(|e| e.clone() as Arc<dyn Engine>));
        engines.extend(self.persists.values().map(|e| e.clone() as Arc<dyn Engine>));
        engines.extend(self.persistence.values().map(|e| e.clone() as Arc<dyn Engine>));
        engines
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start every engine configured to auto start
    ///
    /// Downstream engines start first so no lap result is dropped. A failing
    /// engine does not keep the others from starting.
    pub async fn start(&self) -> SystemResult<()> {
        let mut errors = Vec::new();
        for (engine, auto_start) in self.all_engines() {
            if !auto_start {
                debug!(engine = %engine.key(), "Engine not auto started");
                continue;
            }
            if let Err(e) = engine.start().await {
                error!(engine = %engine.key(), error = %e, "Failed to start engine");
                errors.push(e.to_string());
            }
        }
        info!(system = %self.name(), valid = self.is_valid(), "System started");
        self.notify_started().await;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SystemError::Lifecycle {
                action: "start",
                errors,
            })
        }
    }

    /// Stop every engine that should be running
    pub async fn stop(&self) -> SystemResult<()> {
        let mut errors = Vec::new();
        for engine in self.engines_in_stop_order() {
            if !engine.status().should_run {
                continue;
            }
            if let Err(e) = engine.stop().await {
                error!(engine = %engine.key(), error = %e, "Failed to stop engine");
                errors.push(e.to_string());
            }
        }
        info!(system = %self.name(), "System stopped");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SystemError::Lifecycle {
                action: "stop",
                errors,
            })
        }
    }

    /// Release devices, persistence backends and mail senders
    pub async fn disconnect(&self) {
        self.devices.disconnect_all().await;
        for engine in self.persistence.values() {
            if let Err(e) = engine.stop().await {
                warn!(engine = %engine.key(), error = %e, "Failed to disconnect persistence");
            }
        }
        for sender in self.mail.values() {
            sender.disconnect().await;
        }
        info!(system = %self.name(), "System disconnected");
    }

    async fn notify_started(&self) {
        let Some(id) = &self.config.system.notify_mail else {
            return;
        };
        let Some(sender) = self.mail.get(id) else {
            return;
        };

        let subject = format!("{} started", self.name());
        let mut body = if self.is_valid() {
            "Configuration is valid.".to_string()
        } else {
            format!("Configuration has {} error(s):", self.errors.len())
        };
        for e in &self.errors {
            body.push_str("\n- ");
            body.push_str(e);
        }
        if let Err(e) = sender.send(&subject, &body).await {
            warn!(sender = %id, error = %e, "Failed to send startup mail");
        }
    }

    /// Run a control lap for `action` on the control engine `engine_id`
    pub async fn execute_control_action(
        &self,
        engine_id: &str,
        action: &ControlAction,
    ) -> SystemResult<LapOutcome> {
        let Some(control) = self.controls.get(engine_id) else {
            return Err(match self.engine(engine_id) {
                Some(_) => SystemError::NotAControl(engine_id.to_string()),
                None => SystemError::UnknownEngine(engine_id.to_string()),
            });
        };
        Ok(control.consume_action(action).await?)
    }

    pub fn status(&self) -> SystemStatus {
        let mut engines: Vec<EngineSnapshot> = self
            .all_engines()
            .into_iter()
            .map(|(engine, _)| engine.snapshot())
            .collect();
        engines.sort_by(|a, b| a.key.cmp(&b.key));
        SystemStatus {
            name: self.name().to_string(),
            valid: self.is_valid(),
            errors: self.errors.clone(),
            devices: self.devices.ids(),
            engines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::LogMailSender;
    use crate::persistence::TimeRange;
    use serde_json::json;

    fn system(value: serde_json::Value) -> CastleAcDc {
        CastleAcDc::build(serde_json::from_value(value).unwrap())
    }

    fn pipeline() -> serde_json::Value {
        json!({
            "system": { "name": "test", "notifyMail": "ops" },
            "devices": {
                "heater": {
                    "type": "sim-constant",
                    "settings": { "value": 20.0 },
                    "mapDatapoints": { "value": { "id": "temp", "name": "Temperature" } }
                }
            },
            "engines": {
                "poll": {
                    "collector": {
                        "lapDuration": -1,
                        "sources": [{ "deviceId": "heater" }]
                    }
                },
                "datastate": {
                    "state": {
                        "calculators": [{
                            "datapoint": { "id": "double", "name": "Double", "valueType": "number" },
                            "code": "get(\"temp@heater\") * 2"
                        }]
                    }
                },
                "heating": {
                    "control": {
                        "parts": [{
                            "type": "actions",
                            "actions": {
                                "boost": [{
                                    "target": { "deviceId": "heater", "datapointId": "value@heater" },
                                    "value": 30.0
                                }]
                            }
                        }]
                    }
                },
                "history": {
                    "persist": {
                        "persistence": "mem",
                        "datapointLog": { "ids": ["*"] },
                        "controlLog": true
                    }
                }
            },
            "persistence": { "mem": { "type": "memory" } },
            "mail": { "ops": { "type": "log", "to": ["ops@example.org"] } }
        })
    }

    #[tokio::test]
    async fn test_pipeline_end_to_end() {
        let system = system(pipeline());
        assert!(system.is_valid(), "{:?}", system.errors());
        system.start().await.unwrap();

        system.collector("poll").unwrap().run_lap().await;
        let state = system.datastate().unwrap().current();
        assert_eq!(state.get_state("temp@heater").unwrap().value_num, Some(20.0));
        assert_eq!(state.get_state("double").unwrap().value_num, Some(40.0));

        let backend = system.persistence("mem").unwrap().backend();
        let rows = backend
            .select_datapoint_rows(TimeRange::new(0, i64::MAX))
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.datapoint_id.as_str()).collect();
        assert!(ids.contains(&"temp@heater"));
        assert!(ids.contains(&"double"));

        let outcome = system
            .execute_control_action("heating", &ControlAction::new("boost"))
            .await
            .unwrap();
        assert_eq!(outcome.executed.len(), 1);
        assert!(outcome.executed[0].success);
        let controls = backend
            .select_control_rows(TimeRange::new(0, i64::MAX))
            .await
            .unwrap();
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].value_num, Some(30.0));

        // A later sample carries a new timestamp
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        system.collector("poll").unwrap().run_lap().await;
        let state = system.datastate().unwrap().current();
        assert_eq!(state.get_state("double").unwrap().value_num, Some(60.0));

        system.stop().await.unwrap();
        system.disconnect().await;
    }

    #[tokio::test]
    async fn test_invalid_entries_are_left_out() {
        let mut config = pipeline();
        config["engines"]["broken"] = json!({ "collector": { "sources": [{ "deviceId": "nope" }] } });
        config["engines"]["datastate"]["state"]["calculators"][0]["code"] = json!("get(");

        let system = system(config);
        assert!(!system.is_valid());
        assert!(system.collector("broken").is_none());
        assert!(system.collector("poll").is_some());
        assert!(system.errors().iter().any(|e| e.starts_with("engines.broken:")));
        assert!(system.errors().iter().any(|e| e.contains("calculator 'double'")));

        let status = system.status();
        assert!(!status.valid);
        assert_eq!(status.devices, vec!["heater"]);
        let keys: Vec<&str> = status.engines.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["datastate", "heating", "history", "mem", "poll"]);
    }

    #[tokio::test]
    async fn test_start_respects_auto_start_and_mails() {
        let mut config = pipeline();
        config["engines"]["heating"]["control"]["autoStart"] = json!(false);
        let system = system(config);
        system.start().await.unwrap();

        assert!(system.engine("poll").unwrap().status().should_run);
        assert!(!system.engine("heating").unwrap().status().should_run);
        assert!(matches!(
            system
                .execute_control_action("heating", &ControlAction::new("boost"))
                .await,
            Err(SystemError::Engine(EngineError::NotRunning(_)))
        ));
        assert!(matches!(
            system.execute_control_action("poll", &ControlAction::new("boost")).await,
            Err(SystemError::NotAControl(_))
        ));
        assert!(matches!(
            system.execute_control_action("nope", &ControlAction::new("boost")).await,
            Err(SystemError::UnknownEngine(_))
        ));

        system.stop().await.unwrap();
        assert!(!system.engine("poll").unwrap().status().should_run);
        assert!(!system.engine("mem").unwrap().status().should_run);
    }

    #[tokio::test]
    async fn test_startup_mail_lists_errors() {
        let mut config = pipeline();
        config["devices"]["bad@id"] = json!({ "type": "sim-seconds" });
        let mut system = system(config);
        let sender = Arc::new(LogMailSender::new("ops", vec!["ops@example.org".into()]));
        system.mail.insert("ops".into(), sender.clone());

        system.start().await.unwrap();
        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "test started");
        assert!(sent[0].body.contains("devices.bad@id"));
        system.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_control_without_datastate_follows_collectors() {
        let mut config = pipeline();
        config["engines"]
            .as_object_mut()
            .unwrap()
            .remove("datastate");
        let system = system(config);
        assert!(system.is_valid(), "{:?}", system.errors());
        system.start().await.unwrap();

        system.collector("poll").unwrap().run_lap().await;
        let rows = system
            .persistence("mem")
            .unwrap()
            .backend()
            .select_datapoint_rows(TimeRange::new(0, i64::MAX))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].datapoint_id, "temp@heater");
        system.stop().await.unwrap();
    }
}
