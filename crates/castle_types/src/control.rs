//! Control context - pending device targets and executed requests
//!
//! A control engine collects the targets proposed by its parts in a
//! `ControlContext` and resolves them at two timing points. Executed requests
//! are kept in a bounded list for visibility.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::{DatapointState, DeviceControlResponse, now_ms};

/// Default number of executed requests kept in a control context
pub const DEFAULT_EXECUTED_REQUESTS: usize = 10;

/// When a pending target is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetTiming {
    /// Right after the part that set the target
    #[default]
    PartEnd,
    /// After all parts of the lap ran
    LapEnd,
}

impl std::fmt::Display for TargetTiming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetTiming::PartEnd => write!(f, "part-end"),
            TargetTiming::LapEnd => write!(f, "lap-end"),
        }
    }
}

/// Address of a controllable device datapoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    pub device_id: String,
    /// Public id of the control datapoint (global or local)
    pub datapoint_id: String,
}

impl TargetSpec {
    pub fn new(device_id: impl Into<String>, datapoint_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            datapoint_id: datapoint_id.into(),
        }
    }
}

/// A proposed, not yet executed, device datapoint value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatapointTarget {
    pub target: TargetSpec,
    pub state: DatapointState,
    pub when: TargetTiming,
}

/// deviceId → datapointId → target
pub type DatapointTargets = HashMap<String, HashMap<String, DatapointTarget>>;

/// Targets sent to one device in one go
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceControlRequest {
    pub targets: Vec<DatapointTarget>,
}

/// A device command that was already issued
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedRequest {
    pub device_id: String,
    pub request: DeviceControlRequest,
    /// Whether the request reached the device
    #[serde(default = "reached_default")]
    pub executed: bool,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: i64,
}

fn reached_default() -> bool {
    true
}

/// Per-engine accumulator of pending targets and executed requests
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlContext {
    pub engine_id: String,
    datapoint_targets: DatapointTargets,
    executed_requests: VecDeque<ExecutedRequest>,
    #[serde(skip)]
    max_executed: usize,
}

impl ControlContext {
    pub fn new(engine_id: impl Into<String>) -> Self {
        Self::with_capacity(engine_id, DEFAULT_EXECUTED_REQUESTS)
    }

    pub fn with_capacity(engine_id: impl Into<String>, max_executed: usize) -> Self {
        Self {
            engine_id: engine_id.into(),
            datapoint_targets: HashMap::new(),
            executed_requests: VecDeque::new(),
            max_executed,
        }
    }

    /// Propose a value for a device datapoint, replacing any pending target
    /// for the same device and datapoint
    pub fn set_datapoint_target(
        &mut self,
        target: TargetSpec,
        state: DatapointState,
        when: TargetTiming,
    ) {
        self.datapoint_targets
            .entry(target.device_id.clone())
            .or_default()
            .insert(
                target.datapoint_id.clone(),
                DatapointTarget {
                    target,
                    state,
                    when,
                },
            );
    }

    pub fn datapoint_targets(&self) -> &DatapointTargets {
        &self.datapoint_targets
    }

    pub fn has_targets(&self) -> bool {
        self.datapoint_targets.values().any(|t| !t.is_empty())
    }

    /// Remove and return all pending targets
    pub fn reset_datapoint_targets(&mut self) -> DatapointTargets {
        std::mem::take(&mut self.datapoint_targets)
    }

    /// Remove and return the pending targets tagged with one of `whens`
    ///
    /// Targets with other timings stay pending.
    pub fn reset_datapoint_targets_partial(&mut self, whens: &[TargetTiming]) -> DatapointTargets {
        let mut reset = DatapointTargets::new();
        for (device_id, targets) in self.datapoint_targets.iter_mut() {
            let due: Vec<String> = targets
                .iter()
                .filter(|(_, t)| whens.contains(&t.when))
                .map(|(id, _)| id.clone())
                .collect();
            for datapoint_id in due {
                if let Some(target) = targets.remove(&datapoint_id) {
                    reset
                        .entry(device_id.clone())
                        .or_default()
                        .insert(datapoint_id, target);
                }
            }
        }
        self.datapoint_targets.retain(|_, targets| !targets.is_empty());
        reset
    }

    pub fn executed_requests(&self) -> impl Iterator<Item = &ExecutedRequest> {
        self.executed_requests.iter()
    }

    pub fn executed_len(&self) -> usize {
        self.executed_requests.len()
    }

    pub fn add_executed_request(
        &mut self,
        device_id: impl Into<String>,
        request: DeviceControlRequest,
        response: DeviceControlResponse,
    ) {
        self.executed_requests.push_back(ExecutedRequest {
            device_id: device_id.into(),
            request,
            executed: response.executed,
            success: response.success,
            error: response.error,
            at: now_ms(),
        });
        trim_front(&mut self.executed_requests, self.max_executed);
    }

    /// Fold `other` into this context
    ///
    /// Pending targets of `other` overwrite same device+datapoint targets,
    /// executed requests are appended and trimmed to the `max_size` most
    /// recent. Returns whether anything changed.
    pub fn add_content_from(&mut self, other: &ControlContext, max_size: usize) -> bool {
        let mut changed = false;
        for (device_id, targets) in &other.datapoint_targets {
            let mine = self.datapoint_targets.entry(device_id.clone()).or_default();
            for (datapoint_id, target) in targets {
                if mine.get(datapoint_id) != Some(target) {
                    mine.insert(datapoint_id.clone(), target.clone());
                    changed = true;
                }
            }
        }
        self.datapoint_targets.retain(|_, targets| !targets.is_empty());

        if !other.executed_requests.is_empty() {
            self.executed_requests
                .extend(other.executed_requests.iter().cloned());
            changed = true;
        }
        trim_front(&mut self.executed_requests, max_size);
        changed
    }

    pub fn copy(&self) -> Self {
        self.clone()
    }
}

fn trim_front<T>(list: &mut VecDeque<T>, max: usize) {
    while list.len() > max {
        list.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ctx: &mut ControlContext, device: &str, dp: &str, value: f64, when: TargetTiming) {
        ctx.set_datapoint_target(
            TargetSpec::new(device, dp),
            DatapointState::number(dp, 1, value),
            when,
        );
    }

    fn count(targets: &DatapointTargets) -> usize {
        targets.values().map(HashMap::len).sum()
    }

    #[test]
    fn test_set_target_overwrites() {
        let mut ctx = ControlContext::new("c");
        set(&mut ctx, "dev", "relay", 1.0, TargetTiming::PartEnd);
        set(&mut ctx, "dev", "relay", 0.0, TargetTiming::LapEnd);
        let targets = ctx.datapoint_targets();
        assert_eq!(count(targets), 1);
        assert_eq!(targets["dev"]["relay"].when, TargetTiming::LapEnd);
    }

    #[test]
    fn test_partial_reset_partitions() {
        let mut ctx = ControlContext::new("c");
        set(&mut ctx, "a", "x", 1.0, TargetTiming::PartEnd);
        set(&mut ctx, "a", "y", 1.0, TargetTiming::LapEnd);
        set(&mut ctx, "b", "z", 1.0, TargetTiming::PartEnd);
        let original = ctx.datapoint_targets().clone();

        let reset = ctx.reset_datapoint_targets_partial(&[TargetTiming::PartEnd]);
        let stay = ctx.datapoint_targets().clone();

        assert_eq!(count(&reset), 2);
        assert_eq!(count(&stay), 1);
        for (device, targets) in &original {
            for id in targets.keys() {
                let in_reset = reset.get(device).is_some_and(|t| t.contains_key(id));
                let in_stay = stay.get(device).is_some_and(|t| t.contains_key(id));
                assert!(in_reset ^ in_stay, "{device}/{id} must be in exactly one side");
            }
        }

        // A second reset with the other timing never double-removes
        let late = ctx.reset_datapoint_targets_partial(&[TargetTiming::LapEnd]);
        assert_eq!(count(&late), 1);
        assert!(late["a"].contains_key("y"));
        assert!(!ctx.has_targets());
        assert!(ctx
            .reset_datapoint_targets_partial(&[TargetTiming::PartEnd])
            .is_empty());
    }

    #[test]
    fn test_add_content_from_keeps_most_recent() {
        let mut history = ControlContext::new("c");
        for i in 0..4 {
            history.add_executed_request(
                format!("old-{i}"),
                Default::default(),
                DeviceControlResponse::ok(),
            );
        }
        let mut lap = ControlContext::new("c");
        for i in 0..3 {
            let response = if i == 1 {
                DeviceControlResponse::rejected("unknown device")
            } else {
                DeviceControlResponse::ok()
            };
            lap.add_executed_request(format!("new-{i}"), Default::default(), response);
        }

        assert!(history.add_content_from(&lap, 5));
        let devices: Vec<&str> = history
            .executed_requests()
            .map(|r| r.device_id.as_str())
            .collect();
        assert_eq!(devices, vec!["old-2", "old-3", "new-0", "new-1", "new-2"]);
    }

    #[test]
    fn test_add_content_from_reports_no_change() {
        let mut history = ControlContext::new("c");
        let empty = ControlContext::new("c");
        assert!(!history.add_content_from(&empty, 10));

        let mut lap = ControlContext::new("c");
        set(&mut lap, "a", "x", 1.0, TargetTiming::LapEnd);
        assert!(history.add_content_from(&lap, 10));
        assert!(!history.add_content_from(&lap, 10));
    }

    #[test]
    fn test_executed_requests_are_ring_bounded() {
        let mut ctx = ControlContext::new("c");
        for i in 0..25 {
            ctx.add_executed_request(format!("d{i}"), Default::default(), DeviceControlResponse::ok());
        }
        assert_eq!(ctx.executed_len(), DEFAULT_EXECUTED_REQUESTS);
        assert_eq!(
            ctx.executed_requests().next().map(|r| r.device_id.as_str()),
            Some("d15")
        );
    }

    #[test]
    fn test_timing_serde_is_kebab_case() {
        assert_eq!(
            serde_json::to_string(&TargetTiming::PartEnd).unwrap(),
            "\"part-end\""
        );
        let lap: TargetTiming = serde_json::from_str("\"lap-end\"").unwrap();
        assert_eq!(lap, TargetTiming::LapEnd);
    }
}
