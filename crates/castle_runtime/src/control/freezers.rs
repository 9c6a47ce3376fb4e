//! Freezer pair control
//!
//! Two freezers share one supply. While the primary freezer is cooling the
//! secondary one is switched off, otherwise it is switched on. The rule only
//! runs when one of its inputs reported a new sample.

use async_trait::async_trait;
use castle_types::{ControlContext, DatapointState, EngineContext, TargetSpec, TargetTiming, now_ms};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::parts::{ControlPart, PartResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreezersSettings {
    pub power_available: String,
    /// Whether the primary freezer is cooling right now
    pub primary_on_off: String,
    pub primary_relay: String,
    pub secondary_on_off: String,
    pub secondary_relay: String,
    /// Where the secondary relay is switched
    pub secondary_relay_target: TargetSpec,
    #[serde(default)]
    pub when: TargetTiming,
}

impl FreezersSettings {
    fn inputs(&self) -> [&str; 5] {
        [
            &self.power_available,
            &self.primary_on_off,
            &self.primary_relay,
            &self.secondary_on_off,
            &self.secondary_relay,
        ]
    }
}

pub struct FreezersControl {
    name: String,
    settings: FreezersSettings,
    last_seen: Option<[Option<i64>; 5]>,
}

impl FreezersControl {
    pub fn new(name: impl Into<String>, settings: FreezersSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            last_seen: None,
        }
    }

    /// Desired secondary relay state
    pub fn desired_secondary(primary_active: bool) -> bool {
        !primary_active
    }
}

#[async_trait]
impl ControlPart for FreezersControl {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, context: &EngineContext, control: &mut ControlContext) -> PartResult {
        let seen = self
            .settings
            .inputs()
            .map(|id| context.get_state(id).map(|s| s.at));
        if self.last_seen == Some(seen) {
            return Ok(());
        }
        self.last_seen = Some(seen);

        let Some(primary_active) = context
            .get_state(&self.settings.primary_on_off)
            .and_then(DatapointState::as_bool)
        else {
            debug!(part = %self.name, "Primary freezer state unknown");
            return Ok(());
        };
        let secondary_on = context
            .get_state(&self.settings.secondary_relay)
            .and_then(DatapointState::as_bool);

        let desired = Self::desired_secondary(primary_active);
        if secondary_on != Some(desired) {
            let target = self.settings.secondary_relay_target.clone();
            let state = DatapointState::boolean(&target.datapoint_id, now_ms(), desired);
            control.set_datapoint_target(target, state, self.settings.when);
        }
        Ok(())
    }
}
