//! Configuration Validation
//!
//! Checks every entry of a `ConfigDocument` on its own and against the
//! entries it references. Problems are collected as messages; an entry with
//! a problem is left out, everything else is kept.

use std::collections::{BTreeMap, HashSet};

use serde::de::DeserializeOwned;
use tracing::warn;

use super::types::*;
use crate::devices::{control_datapoints, device_datapoints};

/// Entries that passed validation, plus the collected errors
#[derive(Debug, Clone, Default)]
pub struct ValidConfig {
    pub system: SystemConfig,
    pub devices: BTreeMap<String, DeviceConfig>,
    pub collectors: BTreeMap<String, CollectorConfig>,
    pub datastate: Option<StateConfig>,
    pub controls: BTreeMap<String, ControlConfig>,
    pub persists: BTreeMap<String, PersistConfig>,
    pub persistence: BTreeMap<String, PersistenceConfig>,
    pub mail: BTreeMap<String, MailConfig>,
    pub errors: Vec<String>,
}

impl ValidConfig {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Ids of all kept engines
    pub fn engine_ids(&self) -> HashSet<&str> {
        self.collectors
            .keys()
            .chain(self.controls.keys())
            .chain(self.persists.keys())
            .map(String::as_str)
            .chain(self.datastate.as_ref().map(|_| DATASTATE_KEY))
            .collect()
    }
}

/// Collects the messages of one entry
struct Problems<'a> {
    prefix: String,
    errors: &'a mut Vec<String>,
    found: bool,
}

impl<'a> Problems<'a> {
    fn new(errors: &'a mut Vec<String>, section: &str, id: &str) -> Self {
        Self {
            prefix: format!("{section}.{id}"),
            errors,
            found: false,
        }
    }

    fn add(&mut self, message: impl std::fmt::Display) {
        let message = format!("{}: {message}", self.prefix);
        warn!("Invalid configuration: {message}");
        self.errors.push(message);
        self.found = true;
    }

    fn check(&mut self, ok: bool, message: impl std::fmt::Display) {
        if !ok {
            self.add(message);
        }
    }

    fn ok(&self) -> bool {
        !self.found
    }
}

fn parse<T: DeserializeOwned>(
    errors: &mut Vec<String>,
    section: &str,
    id: &str,
    value: &serde_json::Value,
) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            Problems::new(errors, section, id).add(e);
            None
        }
    }
}

/// Validate a whole document
pub fn validate(document: &ConfigDocument) -> ValidConfig {
    let mut valid = ValidConfig {
        system: document.system.clone(),
        ..Default::default()
    };

    // Persistence & mail
    for (id, value) in &document.persistence {
        if let Some(config) = parse(&mut valid.errors, "persistence", id, value) {
            valid.persistence.insert(id.clone(), config);
        }
    }
    for (id, value) in &document.mail {
        if let Some(config) = parse(&mut valid.errors, "mail", id, value) {
            valid.mail.insert(id.clone(), config);
        }
    }
    if let Some(mail) = &document.system.notify_mail {
        if !valid.mail.contains_key(mail) {
            valid
                .errors
                .push(format!("system: unknown mail sender '{mail}'"));
        }
    }

    // Devices
    for (id, value) in &document.devices {
        let Some(config) = parse::<DeviceConfig>(&mut valid.errors, "devices", id, value) else {
            continue;
        };
        if check_device(&mut valid.errors, id, &config) {
            valid.devices.insert(id.clone(), config);
        }
    }

    // Engines
    let mut engines = Vec::new();
    for (id, value) in &document.engines {
        if let Some(config) = parse::<EngineConfig>(&mut valid.errors, "engines", id, value) {
            engines.push((id.as_str(), config));
        }
    }

    let mut states = Vec::new();
    let mut controls = Vec::new();
    let mut persists = Vec::new();
    for (id, engine) in engines {
        let is_datastate = id == DATASTATE_KEY;
        match engine {
            EngineConfig::State(config) if is_datastate => states.push(config),
            EngineConfig::State(_) => Problems::new(&mut valid.errors, "engines", id)
                .add(format!("a state engine must use the key '{DATASTATE_KEY}'")),
            _ if is_datastate => Problems::new(&mut valid.errors, "engines", id)
                .add("the key is reserved for the state engine"),
            EngineConfig::Collector(config) => {
                if check_collector(&mut valid.errors, id, &config, &valid.devices) {
                    valid.collectors.insert(id.to_string(), config);
                }
            }
            EngineConfig::Control(config) => controls.push((id, config)),
            EngineConfig::Persist(config) => persists.push((id, config)),
        }
    }

    if let Some(config) = states.pop() {
        let mut problems = Problems::new(&mut valid.errors, "engines", DATASTATE_KEY);
        for source in &config.sources {
            problems.check(
                valid.collectors.contains_key(source),
                format!("unknown collector '{source}'"),
            );
        }
        if problems.ok() {
            valid.datastate = Some(config);
        }
    }

    for (id, config) in controls {
        let mut problems = Problems::new(&mut valid.errors, "engines", id);
        for source in &config.sources {
            let known = valid.collectors.contains_key(source)
                || (source == DATASTATE_KEY && valid.datastate.is_some());
            problems.check(known, format!("unknown source engine '{source}'"));
        }
        problems.check(config.max_history > 0, "maxHistory must be positive");
        for (index, part) in config.parts.iter().enumerate() {
            for target in part.targets() {
                let device = target.device_id.as_str();
                match valid.devices.get(device) {
                    None => problems.add(format!(
                        "part '{}' targets unknown device '{device}'",
                        part.name(index)
                    )),
                    Some(d) if !d.device_type.capabilities().control => problems.add(format!(
                        "part '{}' targets device '{device}' which cannot be controlled",
                        part.name(index)
                    )),
                    Some(d) => {
                        let known = control_datapoints(device, d.device_type, d).iter().any(|dp| {
                            dp.public.datapoint.id == target.datapoint_id
                                || dp.public.local_id == target.datapoint_id
                        });
                        problems.check(
                            known,
                            format!(
                                "part '{}' targets unknown control datapoint '{}' of device '{device}'",
                                part.name(index),
                                target.datapoint_id
                            ),
                        );
                    }
                }
            }
        }
        if problems.ok() {
            valid.controls.insert(id.to_string(), config);
        }
    }

    let known_engines: HashSet<String> =
        valid.engine_ids().into_iter().map(str::to_string).collect();
    for (id, config) in persists {
        let mut problems = Problems::new(&mut valid.errors, "engines", id);
        problems.check(
            valid.persistence.contains_key(&config.persistence),
            format!("unknown persistence '{}'", config.persistence),
        );
        problems.check(
            config.datapoint_log.is_some() || config.control_log || config.sample_log.is_some(),
            "none of datapointLog, controlLog and sampleLog is enabled",
        );
        if let Some(sample) = &config.sample_log {
            problems.check(
                !sample.datapoints.is_empty(),
                format!("sample '{}' has no datapoints", sample.sample_id),
            );
        }
        for source in &config.sources {
            problems.check(
                known_engines.contains(source),
                format!("unknown source engine '{source}'"),
            );
        }
        if problems.ok() {
            valid.persists.insert(id.to_string(), config);
        }
    }

    valid
}

fn check_device(errors: &mut Vec<String>, id: &str, config: &DeviceConfig) -> bool {
    let mut problems = Problems::new(errors, "devices", id);
    let kind = config.device_type;

    problems.check(
        !id.contains('@'),
        "device ids must not contain '@'",
    );
    problems.check(
        !kind.needs_api() || !config.api.is_empty(),
        format!("type {kind} needs an api"),
    );
    if let Err(e) = kind.check_settings(&config.settings) {
        problems.add(e);
    }

    if config.datapoints.is_none() {
        let schema: HashSet<String> = kind.datapoints().into_iter().map(|d| d.id).collect();
        for key in config.map_datapoints.keys() {
            problems.check(
                schema.contains(key),
                format!("mapDatapoints: type {kind} has no datapoint '{key}'"),
            );
        }
    }
    if config.control_datapoints.is_none() {
        let schema: HashSet<String> = kind
            .control_datapoints()
            .into_iter()
            .map(|d| d.id)
            .collect();
        for key in config.map_control_datapoints.keys() {
            problems.check(
                schema.contains(key),
                format!("mapControlDatapoints: type {kind} has no control datapoint '{key}'"),
            );
        }
    }
    if config.control_datapoints.is_some() && !kind.capabilities().control {
        problems.add(format!("type {kind} cannot be controlled"));
    }

    let mut seen = HashSet::new();
    for dp in device_datapoints(id, kind, config) {
        if !seen.insert(dp.public.datapoint.id.clone()) {
            problems.add(format!("duplicate datapoint '{}'", dp.public.datapoint.id));
        }
    }
    let mut seen = HashSet::new();
    for dp in control_datapoints(id, kind, config) {
        if !seen.insert(dp.public.datapoint.id.clone()) {
            problems.add(format!(
                "duplicate control datapoint '{}'",
                dp.public.datapoint.id
            ));
        }
    }

    problems.ok()
}

fn check_collector(
    errors: &mut Vec<String>,
    id: &str,
    config: &CollectorConfig,
    devices: &BTreeMap<String, DeviceConfig>,
) -> bool {
    let mut problems = Problems::new(errors, "engines", id);
    for source in &config.sources {
        let Some(device) = devices.get(&source.device_id) else {
            problems.add(format!("unknown device '{}'", source.device_id));
            continue;
        };
        let kind = device.device_type;
        if !kind.capabilities().collect {
            problems.add(format!("device '{}' does not collect data", source.device_id));
            continue;
        }
        if let Some(wanted) = &source.datapoints {
            let public: HashSet<String> = device_datapoints(&source.device_id, kind, device)
                .into_iter()
                .map(|d| d.public.datapoint.id)
                .collect();
            for dp in wanted {
                problems.check(
                    public.contains(dp),
                    format!("device '{}' has no datapoint '{dp}'", source.device_id),
                );
            }
        }
    }
    problems.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document(value: serde_json::Value) -> ConfigDocument {
        serde_json::from_value(value).unwrap()
    }

    fn house() -> serde_json::Value {
        json!({
            "system": { "name": "house", "notifyMail": "ops" },
            "devices": {
                "sun": { "type": "sim-solar", "settings": { "latitude": 52.5, "longitude": 13.4 } },
                "boiler": { "type": "sim-constant", "settings": { "value": 40 } }
            },
            "engines": {
                "collect": {
                    "collector": {
                        "lapDuration": 2000,
                        "sources": [{ "deviceId": "sun", "datapoints": ["elevation@sun"] }, { "deviceId": "boiler" }]
                    }
                },
                "datastate": { "state": { "sources": ["collect"] } },
                "heating": {
                    "control": {
                        "parts": [{
                            "type": "actions",
                            "actions": {
                                "boost": [{ "target": { "deviceId": "boiler", "datapointId": "value" }, "value": 60 }]
                            }
                        }]
                    }
                },
                "history": { "persist": { "persistence": "db", "datapointLog": {}, "controlLog": true } }
            },
            "persistence": { "db": { "type": "memory" } },
            "mail": { "ops": { "type": "log", "to": ["ops@example.org"] } }
        })
    }

    #[test]
    fn test_valid_document() {
        let valid = validate(&document(house()));
        assert!(valid.is_valid(), "{:?}", valid.errors);
        assert_eq!(valid.devices.len(), 2);
        assert!(valid.collectors.contains_key("collect"));
        assert!(valid.datastate.is_some());
        assert!(valid.controls.contains_key("heating"));
        assert_eq!(
            valid.persists["history"].datapoint_log,
            Some(DatapointLogConfig::default())
        );
        assert_eq!(valid.engine_ids().len(), 4);
    }

    #[test]
    fn test_sample_log_needs_datapoints() {
        let mut value = house();
        value["engines"]["history"] = json!({
            "persist": {
                "persistence": "db",
                "sampleLog": { "sampleId": "curve", "name": "Curve", "datapoints": [] }
            }
        });
        let valid = validate(&document(value.clone()));
        assert!(valid.persists.is_empty());
        assert!(valid
            .errors
            .contains(&"engines.history: sample 'curve' has no datapoints".to_string()));

        value["engines"]["history"]["persist"]["sampleLog"]["datapoints"] =
            json!([{ "id": "value@boiler", "meaning": "flow" }]);
        let valid = validate(&document(value));
        assert!(valid.is_valid(), "{:?}", valid.errors);
        assert_eq!(
            valid.persists["history"].sample_log.as_ref().map(|s| s.datapoints.len()),
            Some(1)
        );
    }

    #[test]
    fn test_errors_exclude_entries_and_cascade() {
        let mut value = house();
        value["devices"]["boiler"]["settings"] = json!({ "value": "hot" });
        value["engines"]["other-state"] = json!({ "state": {} });
        value["persistence"] = json!({});

        let valid = validate(&document(value));
        assert!(!valid.is_valid());
        assert!(!valid.devices.contains_key("boiler"));
        // The collector reads the excluded device, the control writes to it
        assert!(valid.collectors.is_empty());
        assert!(valid.controls.is_empty());
        assert!(valid.persists.is_empty());
        // The datastate lost its source collector
        assert!(valid.datastate.is_none());

        let joined = valid.errors.join("\n");
        assert!(joined.contains("devices.boiler: invalid settings"));
        assert!(joined.contains("engines.other-state: a state engine must use the key"));
        assert!(joined.contains("engines.history: unknown persistence 'db'"));
    }

    #[test]
    fn test_unknown_datapoint_and_reserved_key() {
        let value = json!({
            "devices": { "sun": { "type": "sim-solar", "settings": { "latitude": 0, "longitude": 0 } } },
            "engines": {
                "collect": { "collector": { "sources": [{ "deviceId": "sun", "datapoints": ["moon@sun"] }] } },
                "datastate": { "collector": {} }
            },
            "system": { "notifyMail": "nobody" }
        });
        let valid = validate(&document(value));
        assert_eq!(valid.errors.len(), 3, "{:?}", valid.errors);
        assert!(valid.errors.iter().any(|e| e.contains("no datapoint 'moon@sun'")));
        assert!(valid.errors.iter().any(|e| e.contains("reserved")));
        assert!(valid.errors.iter().any(|e| e.contains("unknown mail sender")));
    }

    #[test]
    fn test_control_targets_must_be_control_datapoints() {
        let mut value = house();
        value["devices"]["boiler"]["mapControlDatapoints"] = json!({ "value": { "id": "setpoint" } });
        value["engines"]["heating"]["control"]["parts"][0]["actions"]["boost"] = json!([
            { "target": { "deviceId": "boiler", "datapointId": "setpoint@boiler" }, "value": 60 },
            { "target": { "deviceId": "boiler", "datapointId": "setpoint" }, "value": 60 }
        ]);
        let valid = validate(&document(value.clone()));
        assert!(valid.is_valid(), "{:?}", valid.errors);

        value["engines"]["heating"]["control"]["parts"][0]["actions"]["boost"] = json!([
            { "target": { "deviceId": "boiler", "datapointId": "value" }, "value": 60 }
        ]);
        let valid = validate(&document(value));
        assert!(!valid.controls.contains_key("heating"));
        assert_eq!(
            valid.errors,
            vec!["engines.heating: part 'actions-0' targets unknown control datapoint 'value' of device 'boiler'"]
        );
    }

    #[test]
    fn test_malformed_entry_is_reported() {
        let value = json!({
            "devices": { "x": { "type": "teleporter" } },
            "engines": { "e": { "collector": {}, "control": {} } }
        });
        let valid = validate(&document(value));
        assert_eq!(valid.errors.len(), 2);
        assert!(valid.errors[0].starts_with("devices.x: "));
        assert!(valid.errors[1].starts_with("engines.e: "));
    }
}
