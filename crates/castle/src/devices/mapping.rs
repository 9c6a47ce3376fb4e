//! Datapoint Id Mapping
//!
//! A device type speaks in private ids (`power`). The rest of the system sees
//! the public local id chosen in the device configuration (`grid-power`) and
//! the public global id `<localId>@<deviceId>` (`grid-power@meter`).

use std::collections::HashMap;

use castle_types::{Datapoint, DeviceDatapoint};

use super::DeviceTypeKind;
use crate::config::{DatapointRename, DeviceConfig};

/// A public datapoint and the private one behind it
#[derive(Debug, Clone, PartialEq)]
pub struct MappedDatapoint {
    pub private: Datapoint,
    pub public: DeviceDatapoint,
}

pub fn global_id(local_id: &str, device_id: &str) -> String {
    format!("{local_id}@{device_id}")
}

fn map_schema(
    device_id: &str,
    explicit: Option<&Vec<Datapoint>>,
    schema: Vec<Datapoint>,
    renames: &HashMap<String, DatapointRename>,
) -> Vec<MappedDatapoint> {
    if let Some(explicit) = explicit {
        return explicit
            .iter()
            .map(|dp| MappedDatapoint {
                private: dp.clone(),
                public: DeviceDatapoint {
                    datapoint: Datapoint {
                        id: global_id(&dp.id, device_id),
                        ..dp.clone()
                    },
                    device_id: device_id.to_string(),
                    local_id: dp.id.clone(),
                },
            })
            .collect();
    }

    schema
        .into_iter()
        .map(|private| {
            let rename = renames.get(&private.id);
            let local_id = rename
                .and_then(|r| r.id.clone())
                .unwrap_or_else(|| private.id.clone());
            let name = rename
                .and_then(|r| r.name.clone())
                .unwrap_or_else(|| format!("{} ({device_id})", private.name));
            MappedDatapoint {
                public: DeviceDatapoint {
                    datapoint: Datapoint {
                        id: global_id(&local_id, device_id),
                        name,
                        ..private.clone()
                    },
                    device_id: device_id.to_string(),
                    local_id,
                },
                private,
            }
        })
        .collect()
}

/// Public datapoints of a device
pub fn device_datapoints(
    device_id: &str,
    kind: DeviceTypeKind,
    config: &DeviceConfig,
) -> Vec<MappedDatapoint> {
    map_schema(
        device_id,
        config.datapoints.as_ref(),
        kind.datapoints(),
        &config.map_datapoints,
    )
}

/// Public control datapoints of a device
pub fn control_datapoints(
    device_id: &str,
    kind: DeviceTypeKind,
    config: &DeviceConfig,
) -> Vec<MappedDatapoint> {
    map_schema(
        device_id,
        config.control_datapoints.as_ref(),
        kind.control_datapoints(),
        &config.map_control_datapoints,
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Lookup
// ─────────────────────────────────────────────────────────────────────────────

/// Lookups between private and public ids, built once per device
#[derive(Debug, Clone, Default)]
pub struct DatapointIdMapping {
    private_to_public: HashMap<String, String>,
    public_local_to_private: HashMap<String, String>,
    public_global_to_private: HashMap<String, String>,
}

impl DatapointIdMapping {
    pub fn new(datapoints: &[MappedDatapoint]) -> Self {
        let mut mapping = Self::default();
        for dp in datapoints {
            let private = &dp.private.id;
            mapping
                .private_to_public
                .insert(private.clone(), dp.public.datapoint.id.clone());
            mapping
                .public_local_to_private
                .insert(dp.public.local_id.clone(), private.clone());
            mapping
                .public_global_to_private
                .insert(dp.public.datapoint.id.clone(), private.clone());
        }
        mapping
    }

    /// Public global id of a private id
    pub fn to_public(&self, private_id: &str) -> Option<&str> {
        self.private_to_public.get(private_id).map(String::as_str)
    }

    /// Private id of a public id, tried as global id first, then as local id
    pub fn to_private(&self, public_id: &str) -> Option<&str> {
        self.public_global_to_private
            .get(public_id)
            .or_else(|| self.public_local_to_private.get(public_id))
            .map(String::as_str)
    }
}
