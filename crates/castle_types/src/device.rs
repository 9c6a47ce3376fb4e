//! Device status and control response records

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{DatapointState, now_ms};

/// Result of one status fetch from a device
///
/// Communication problems are reported through `responsive` and `error`,
/// never as a Rust error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub accessed_at: i64,
    pub responsive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub datapoints: HashMap<String, DatapointState>,
}

impl DeviceStatus {
    pub fn responsive(datapoints: HashMap<String, DatapointState>) -> Self {
        Self {
            accessed_at: now_ms(),
            responsive: true,
            error: None,
            datapoints,
        }
    }

    pub fn unresponsive(error: impl Into<String>) -> Self {
        Self {
            accessed_at: now_ms(),
            responsive: false,
            error: Some(error.into()),
            datapoints: HashMap::new(),
        }
    }
}

/// Outcome of a control request sent to a device
///
/// `executed` tells whether the request reached the device at all; a
/// request can be executed and still fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceControlResponse {
    #[serde(default = "executed_default")]
    pub executed: bool,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn executed_default() -> bool {
    true
}

impl DeviceControlResponse {
    pub fn ok() -> Self {
        Self {
            executed: true,
            success: true,
            error: None,
        }
    }

    /// The device was addressed but did not accept the request
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            executed: true,
            success: false,
            error: Some(error.into()),
        }
    }

    /// The request was never sent
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            executed: false,
            success: false,
            error: Some(error.into()),
        }
    }
}
