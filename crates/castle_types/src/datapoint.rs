//! Datapoints and their timestamped states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current wall clock time as unix milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Format unix milliseconds as an RFC 3339 string
pub fn format_ms(at: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(at).map(|d| d.to_rfc3339())
}

// ─────────────────────────────────────────────────────────────────────────────
// Datapoint
// ─────────────────────────────────────────────────────────────────────────────

/// Value type of a datapoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    Number,
    String,
    Boolean,
    Date,
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueType::Number => write!(f, "number"),
            ValueType::String => write!(f, "string"),
            ValueType::Boolean => write!(f, "boolean"),
            ValueType::Date => write!(f, "date"),
        }
    }
}

/// A named, typed observable or controllable value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datapoint {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Datapoint {
    pub fn new(id: impl Into<String>, name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            value_type,
            value_unit: None,
            note: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.value_unit = Some(unit.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// A datapoint that belongs to a device
///
/// `local_id` is the id inside the device type's schema, `datapoint.id` the
/// id used everywhere else in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDatapoint {
    #[serde(flatten)]
    pub datapoint: Datapoint,
    pub device_id: String,
    pub local_id: String,
}

impl DeviceDatapoint {
    pub fn id(&self) -> &str {
        &self.datapoint.id
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Datapoint State
// ─────────────────────────────────────────────────────────────────────────────

/// One observed or derived value of a datapoint at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatapointState {
    pub id: String,
    /// Unix milliseconds
    pub at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_num: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DatapointState {
    /// A state without any value
    pub fn empty(id: impl Into<String>, at: i64) -> Self {
        Self {
            id: id.into(),
            at,
            value_num: None,
            value_string: None,
            error: None,
        }
    }

    pub fn number(id: impl Into<String>, at: i64, value: f64) -> Self {
        Self {
            value_num: Some(value),
            ..Self::empty(id, at)
        }
    }

    pub fn string(id: impl Into<String>, at: i64, value: impl Into<String>) -> Self {
        Self {
            value_string: Some(value.into()),
            ..Self::empty(id, at)
        }
    }

    /// Booleans carry both representations: 0/1 and "false"/"true"
    pub fn boolean(id: impl Into<String>, at: i64, value: bool) -> Self {
        Self {
            value_num: Some(if value { 1.0 } else { 0.0 }),
            value_string: Some(value.to_string()),
            ..Self::empty(id, at)
        }
    }

    /// Dates carry epoch milliseconds and a formatted string
    pub fn date(id: impl Into<String>, at: i64, epoch_ms: i64) -> Self {
        Self {
            value_num: Some(epoch_ms as f64),
            value_string: format_ms(epoch_ms),
            ..Self::empty(id, at)
        }
    }

    pub fn failed(id: impl Into<String>, at: i64, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::empty(id, at)
        }
    }

    /// Same state under another id
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..self.clone()
        }
    }

    pub fn has_value(&self) -> bool {
        self.value_num.is_some() || self.value_string.is_some()
    }

    /// Interpret the state as a boolean (numeric non-zero or "true")
    pub fn as_bool(&self) -> Option<bool> {
        match (self.value_num, self.value_string.as_deref()) {
            (Some(n), _) if !n.is_nan() => Some(n != 0.0),
            (_, Some("true")) => Some(true),
            (_, Some("false")) => Some(false),
            _ => None,
        }
    }

    /// Compare values, ignoring `at`, `id` and `error`
    pub fn same_value(&self, other: &DatapointState) -> bool {
        self.value_num == other.value_num && self.value_string == other.value_string
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boolean_state_has_both_representations() {
        let state = DatapointState::boolean("relay", 10, true);
        assert_eq!(state.value_num, Some(1.0));
        assert_eq!(state.value_string.as_deref(), Some("true"));
        assert_eq!(state.as_bool(), Some(true));
    }

    #[test]
    fn test_date_state_is_formatted() {
        let state = DatapointState::date("d", 0, 0);
        assert_eq!(state.value_num, Some(0.0));
        assert_eq!(
            state.value_string.as_deref(),
            Some("1970-01-01T00:00:00+00:00")
        );
    }

    #[test]
    fn test_same_value_ignores_timestamp() {
        let a = DatapointState::number("x", 1, 2.5);
        let b = DatapointState::number("x", 99, 2.5);
        assert!(a.same_value(&b));
        assert!(!a.same_value(&DatapointState::number("x", 1, 3.0)));
    }

    #[test]
    fn test_value_type_serde() {
        let dp: Datapoint = serde_json::from_str(
            r#"{"id":"p","name":"Power","valueType":"number","valueUnit":"W"}"#,
        )
        .unwrap();
        assert_eq!(dp.value_type, ValueType::Number);
        assert_eq!(dp.value_unit.as_deref(), Some("W"));
    }
}
