//! Direct actions mapped to device writes

use std::collections::HashMap;

use async_trait::async_trait;
use castle_types::{ControlContext, DatapointState, EngineContext, TargetSpec, TargetTiming, now_ms};
use serde::{Deserialize, Serialize};

use crate::parts::{ControlAction, ControlPart, PartError, PartResult};

/// One write performed when an action fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionWrite {
    pub target: TargetSpec,
    /// Default value; overridden by an action's `value` param
    pub value: serde_json::Value,
    #[serde(default)]
    pub when: TargetTiming,
}

/// Control part that only reacts to actions
pub struct ActionControl {
    name: String,
    actions: HashMap<String, Vec<ActionWrite>>,
}

impl ActionControl {
    pub fn new(name: impl Into<String>, actions: HashMap<String, Vec<ActionWrite>>) -> Self {
        Self {
            name: name.into(),
            actions,
        }
    }
}

fn target_state(id: &str, value: &serde_json::Value) -> Result<DatapointState, PartError> {
    let at = now_ms();
    match value {
        serde_json::Value::Bool(b) => Ok(DatapointState::boolean(id, at, *b)),
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(|n| DatapointState::number(id, at, n))
            .ok_or_else(|| PartError::new(format!("{id}: number out of range"))),
        serde_json::Value::String(s) => Ok(DatapointState::string(id, at, s.clone())),
        other => Err(PartError::new(format!("{id}: unsupported value {other}"))),
    }
}

#[async_trait]
impl ControlPart for ActionControl {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, _context: &EngineContext, _control: &mut ControlContext) -> PartResult {
        Ok(())
    }

    async fn run_for_action(
        &mut self,
        action: &ControlAction,
        _context: &EngineContext,
        control: &mut ControlContext,
    ) -> Option<PartResult> {
        let writes = self.actions.get(&action.id)?;
        let override_value = action.params.get("value");
        for write in writes {
            let value = override_value.unwrap_or(&write.value);
            match target_state(&write.target.datapoint_id, value) {
                Ok(state) => control.set_datapoint_target(write.target.clone(), state, write.when),
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(()))
    }
}
