//! Device Types
//!
//! The closed set of device types. Each type declares the private schema of
//! its datapoints and control datapoints and what it is capable of.

use castle_types::{Datapoint, ValueType};
use serde::{Deserialize, Serialize};

use super::http::HttpSettings;
use super::simulation::{ConstantSettings, FileSettings};
use super::solar::SolarSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceTypeKind {
    /// Polls a JSON document over HTTP
    HttpJson,
    /// Fed by the message bus, pushes live updates
    Mqtt,
    SimConstant,
    SimSeconds,
    SimSolar,
    /// Replays a recorded time series
    SimFile,
}

/// What a device type can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub collect: bool,
    pub control: bool,
    pub push: bool,
}

impl DeviceTypeKind {
    pub const ALL: [DeviceTypeKind; 6] = [
        DeviceTypeKind::HttpJson,
        DeviceTypeKind::Mqtt,
        DeviceTypeKind::SimConstant,
        DeviceTypeKind::SimSeconds,
        DeviceTypeKind::SimSolar,
        DeviceTypeKind::SimFile,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceTypeKind::HttpJson => "http-json",
            DeviceTypeKind::Mqtt => "mqtt",
            DeviceTypeKind::SimConstant => "sim-constant",
            DeviceTypeKind::SimSeconds => "sim-seconds",
            DeviceTypeKind::SimSolar => "sim-solar",
            DeviceTypeKind::SimFile => "sim-file",
        }
    }

    pub fn capabilities(self) -> Capabilities {
        let (collect, control, push) = match self {
            DeviceTypeKind::HttpJson => (true, true, false),
            DeviceTypeKind::Mqtt => (true, true, true),
            DeviceTypeKind::SimConstant => (true, true, false),
            DeviceTypeKind::SimSeconds => (true, false, false),
            DeviceTypeKind::SimSolar => (true, false, false),
            DeviceTypeKind::SimFile => (true, false, false),
        };
        Capabilities {
            collect,
            control,
            push,
        }
    }

    /// Whether `api` must name an address
    pub fn needs_api(self) -> bool {
        matches!(
            self,
            DeviceTypeKind::HttpJson | DeviceTypeKind::Mqtt | DeviceTypeKind::SimFile
        )
    }

    /// Private datapoint schema
    ///
    /// Generic transports have none; devices of those types list their
    /// datapoints explicitly.
    pub fn datapoints(self) -> Vec<Datapoint> {
        match self {
            DeviceTypeKind::HttpJson | DeviceTypeKind::Mqtt => Vec::new(),
            DeviceTypeKind::SimConstant => vec![Datapoint::new("value", "Value", ValueType::Number)],
            DeviceTypeKind::SimSeconds => vec![
                Datapoint::new("seconds", "Seconds", ValueType::Number).with_unit("s"),
            ],
            DeviceTypeKind::SimSolar => vec![
                Datapoint::new("elevation", "Sun elevation", ValueType::Number).with_unit("°"),
                Datapoint::new("azimuth", "Sun azimuth", ValueType::Number).with_unit("°"),
                Datapoint::new("daylight", "Daylight", ValueType::Boolean),
            ],
            DeviceTypeKind::SimFile => vec![Datapoint::new("value", "Value", ValueType::Number)],
        }
    }

    /// Private control datapoint schema
    pub fn control_datapoints(self) -> Vec<Datapoint> {
        match self {
            DeviceTypeKind::SimConstant => vec![Datapoint::new("value", "Value", ValueType::Number)],
            _ => Vec::new(),
        }
    }

    /// Check the type specific `settings` of a device
    pub fn check_settings(self, settings: &serde_json::Value) -> Result<(), String> {
        fn parse<T: serde::de::DeserializeOwned>(settings: &serde_json::Value) -> Result<(), String> {
            settings_of::<T>(settings)
                .map(|_| ())
                .map_err(|e| format!("invalid settings: {e}"))
        }

        match self {
            DeviceTypeKind::HttpJson => parse::<HttpSettings>(settings),
            DeviceTypeKind::SimConstant => parse::<ConstantSettings>(settings),
            DeviceTypeKind::SimSolar => parse::<SolarSettings>(settings),
            DeviceTypeKind::SimFile => parse::<FileSettings>(settings),
            DeviceTypeKind::Mqtt | DeviceTypeKind::SimSeconds => Ok(()),
        }
    }
}

impl std::fmt::Display for DeviceTypeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings of a device, `null` read as an empty object
pub(crate) fn settings_of<T: serde::de::DeserializeOwned>(
    settings: &serde_json::Value,
) -> Result<T, serde_json::Error> {
    match settings {
        serde_json::Value::Null => serde_json::from_value(serde_json::json!({})),
        other => serde_json::from_value(other.clone()),
    }
}
