//! Configuration Types
//!
//! The configuration document as it is stored on disk. Entries of the keyed
//! sections are kept as raw JSON until validation so that one malformed
//! entry does not reject the whole document.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use castle_runtime::control::{ActionWrite, FreezersSettings};
use castle_runtime::datastate::DatapointMapping;
use castle_types::{Datapoint, DatapointSequence, TargetSpec};
use serde::{Deserialize, Serialize};

use crate::devices::DeviceTypeKind;

/// Engine key reserved for the system datastate
pub const DATASTATE_KEY: &str = "datastate";

/// Root of a configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub devices: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub engines: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub persistence: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub mail: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    #[serde(default = "default_system_name")]
    pub name: String,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Mail sender notified when the system started
    #[serde(default)]
    pub notify_mail: Option<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: default_system_name(),
            auto_start: true,
            notify_mail: None,
        }
    }
}

fn default_system_name() -> String {
    "castle".to_string()
}

fn default_true() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Devices
// ─────────────────────────────────────────────────────────────────────────────

/// Renames a datapoint of the device type's schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatapointRename {
    /// Public local id; defaults to the type's id
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    #[serde(rename = "type")]
    pub device_type: DeviceTypeKind,
    #[serde(default)]
    pub name: Option<String>,
    /// Address of the device: a URL, a topic prefix or a file
    #[serde(default)]
    pub api: String,
    /// Explicit schema; replaces the type's datapoints
    #[serde(default)]
    pub datapoints: Option<Vec<Datapoint>>,
    #[serde(default)]
    pub control_datapoints: Option<Vec<Datapoint>>,
    #[serde(default)]
    pub map_datapoints: HashMap<String, DatapointRename>,
    #[serde(default)]
    pub map_control_datapoints: HashMap<String, DatapointRename>,
    /// Type specific settings
    #[serde(default)]
    pub settings: serde_json::Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// Engines
// ─────────────────────────────────────────────────────────────────────────────

/// One engine; exactly one of the variants per entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineConfig {
    Collector(CollectorConfig),
    State(StateConfig),
    Control(ControlConfig),
    Persist(PersistConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorSource {
    pub device_id: String,
    /// Public global ids to collect; all when absent
    #[serde(default)]
    pub datapoints: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorConfig {
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_lap_duration")]
    pub lap_duration: i64,
    #[serde(default)]
    pub sources: Vec<CollectorSource>,
}

fn default_lap_duration() -> i64 {
    5000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculatorConfig {
    pub datapoint: Datapoint,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateConfig {
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default)]
    pub mappings: Vec<DatapointMapping>,
    #[serde(default)]
    pub calculators: Vec<CalculatorConfig>,
    #[serde(default)]
    pub sequences: Vec<DatapointSequence>,
    /// Collector engines feeding the state; all collectors when empty
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlPartConfig {
    Freezers {
        #[serde(default)]
        name: Option<String>,
        settings: FreezersSettings,
    },
    Actions {
        #[serde(default)]
        name: Option<String>,
        actions: HashMap<String, Vec<ActionWrite>>,
    },
}

impl ControlPartConfig {
    pub fn name(&self, index: usize) -> String {
        let (name, kind) = match self {
            ControlPartConfig::Freezers { name, .. } => (name, "freezers"),
            ControlPartConfig::Actions { name, .. } => (name, "actions"),
        };
        name.clone().unwrap_or_else(|| format!("{kind}-{index}"))
    }

    /// Datapoints the part writes to
    pub fn targets(&self) -> Vec<&TargetSpec> {
        match self {
            ControlPartConfig::Freezers { settings, .. } => vec![&settings.secondary_relay_target],
            ControlPartConfig::Actions { actions, .. } => {
                actions.values().flatten().map(|w| &w.target).collect()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlConfig {
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Engines whose contexts drive the control; the datastate when empty
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub parts: Vec<ControlPartConfig>,
}

fn default_max_history() -> usize {
    castle_types::DEFAULT_EXECUTED_REQUESTS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatapointLogConfig {
    /// Wildcard patterns of datapoint ids
    #[serde(default = "default_log_ids")]
    pub ids: Vec<String>,
}

impl Default for DatapointLogConfig {
    fn default() -> Self {
        Self {
            ids: default_log_ids(),
        }
    }
}

fn default_log_ids() -> Vec<String> {
    vec!["*".to_string()]
}

/// A named recording of a fixed set of datapoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleLogConfig {
    pub sample_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Recording stops after this long; records until stopped when absent
    #[serde(default)]
    pub length_ms: Option<i64>,
    pub datapoints: Vec<SampleDatapointConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleDatapointConfig {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub meaning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistConfig {
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Persistence backend id
    pub persistence: String,
    #[serde(default)]
    pub datapoint_log: Option<DatapointLogConfig>,
    #[serde(default)]
    pub control_log: bool,
    #[serde(default)]
    pub sample_log: Option<SampleLogConfig>,
    /// Engines whose contexts are persisted; defaults by kind when empty
    #[serde(default)]
    pub sources: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence & Mail
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PersistenceConfig {
    Memory {
        #[serde(default = "default_max_rows", rename = "maxRows")]
        max_rows: usize,
    },
    Redb {
        path: PathBuf,
    },
}

fn default_max_rows() -> usize {
    10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MailConfig {
    /// Writes mails to the log
    Log {
        #[serde(default)]
        to: Vec<String>,
    },
}
