//! Devices
//!
//! A device is an instance of one of the closed set of device types. The
//! instance translates between the private ids of its type and the public
//! ids used by the engines, and never fails with a Rust error while talking
//! to the device: problems end up in `DeviceStatus` / `DeviceControlResponse`.
//!
//! | Type | Transport |
//! |------|-----------|
//! | `http-json` | HTTP GET of a JSON document, POST for control |
//! | `mqtt` | In-process message bus fed by an external publisher |
//! | `sim-constant` | Writable constant |
//! | `sim-seconds` | Second of the current minute |
//! | `sim-solar` | Computed sun position |
//! | `sim-file` | Recorded time series, replayed in a loop |

mod collector;
mod http;
mod instance;
mod mapping;
mod mqtt;
mod registry;
mod simulation;
mod solar;
mod types;

pub use collector::DeviceCollectorPart;
pub use http::{HttpJsonDevice, HttpSettings};
pub use instance::DeviceInstance;
pub use mapping::*;
pub use mqtt::{BusMessage, MessageBus, MqttDevice, bridge_json_lines};
pub use registry::DeviceRegistry;
pub use simulation::{
    ConstantDevice, ConstantSettings, FileDevice, FileSettings, Interpolation, SecondsDevice,
    SeriesPoint, sample_series,
};
pub use solar::{SolarDevice, SolarSettings, SunPosition, sun_position};
pub use types::*;

use castle_types::{DatapointState, ValueType};
use chrono::DateTime;

/// Errors raised while setting up or talking to a device
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("Invalid settings for device {device}: {message}")]
    Settings { device: String, message: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Unexpected response: {0}")]
    Response(String),

    #[error("Unknown device: {0}")]
    Unknown(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Value Conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Read a JSON value reported by a device as a state of `value_type`
pub fn state_from_json(
    id: &str,
    value_type: ValueType,
    at: i64,
    value: &serde_json::Value,
) -> Option<DatapointState> {
    use serde_json::Value;

    match (value_type, value) {
        (_, Value::Null) => None,
        (ValueType::Number, Value::Number(n)) => n.as_f64().map(|n| DatapointState::number(id, at, n)),
        (ValueType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .map(|n| DatapointState::number(id, at, n)),
        (ValueType::Number, Value::Bool(b)) => {
            Some(DatapointState::number(id, at, if *b { 1.0 } else { 0.0 }))
        }
        (ValueType::Boolean, Value::Bool(b)) => Some(DatapointState::boolean(id, at, *b)),
        (ValueType::Boolean, Value::Number(n)) => {
            n.as_f64().map(|n| DatapointState::boolean(id, at, n != 0.0))
        }
        (ValueType::Boolean, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "on" | "1" => Some(DatapointState::boolean(id, at, true)),
            "false" | "off" | "0" => Some(DatapointState::boolean(id, at, false)),
            _ => None,
        },
        (ValueType::String, Value::String(s)) => Some(DatapointState::string(id, at, s.clone())),
        (ValueType::String, other) => Some(DatapointState::string(id, at, other.to_string())),
        (ValueType::Date, Value::Number(n)) => {
            n.as_i64().map(|ms| DatapointState::date(id, at, ms))
        }
        (ValueType::Date, Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| DatapointState::date(id, at, d.timestamp_millis())),
        _ => None,
    }
}

/// Value sent to a device for a target state
pub fn state_to_json(value_type: ValueType, state: &DatapointState) -> Option<serde_json::Value> {
    match value_type {
        ValueType::Boolean => state.as_bool().map(serde_json::Value::Bool),
        ValueType::Number | ValueType::Date => state
            .value_num
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number),
        ValueType::String => state
            .value_string
            .clone()
            .map(serde_json::Value::String),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_from_json() {
        let n = state_from_json("p", ValueType::Number, 5, &json!("12.5")).unwrap();
        assert_eq!(n.value_num, Some(12.5));
        assert_eq!(n.at, 5);

        let b = state_from_json("r", ValueType::Boolean, 5, &json!("ON")).unwrap();
        assert_eq!(b.as_bool(), Some(true));

        let d = state_from_json("d", ValueType::Date, 5, &json!("1970-01-01T00:00:01Z")).unwrap();
        assert_eq!(d.value_num, Some(1000.0));

        assert!(state_from_json("p", ValueType::Number, 5, &json!(null)).is_none());
        assert!(state_from_json("p", ValueType::Number, 5, &json!({ "x": 1 })).is_none());
    }

    #[test]
    fn test_state_to_json() {
        let state = DatapointState::boolean("r", 1, false);
        assert_eq!(state_to_json(ValueType::Boolean, &state), Some(json!(false)));
        assert_eq!(state_to_json(ValueType::Number, &state), Some(json!(0.0)));
        assert_eq!(
            state_to_json(ValueType::String, &DatapointState::number("x", 1, 2.0)),
            None
        );
    }
}
