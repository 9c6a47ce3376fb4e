use castle_types::{Datapoint, EngineContext};
use serde::{Deserialize, Serialize};

use crate::parts::{DatastatePart, PartResult};

/// Republishes the state of `source` under the `target` datapoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatapointMapping {
    pub source: String,
    pub target: Datapoint,
}

pub struct MapperPart {
    name: String,
    mappings: Vec<DatapointMapping>,
}

impl MapperPart {
    pub fn new(name: impl Into<String>, mappings: Vec<DatapointMapping>) -> Self {
        Self {
            name: name.into(),
            mappings,
        }
    }
}

impl DatastatePart for MapperPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, state: &mut EngineContext) -> PartResult {
        for mapping in &self.mappings {
            let Some(source) = state.get_state(&mapping.source) else {
                continue;
            };
            let unchanged = state
                .get_state(&mapping.target.id)
                .is_some_and(|current| current.at == source.at && current.same_value(source));
            if unchanged {
                continue;
            }
            let mapped = source.with_id(&mapping.target.id);
            state.set_datapoint(mapping.target.clone(), mapped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castle_types::{DatapointState, ValueType};

    #[test]
    fn test_maps_source_state() {
        let mut part = MapperPart::new(
            "mapper",
            vec![DatapointMapping {
                source: "meter-1/power".into(),
                target: Datapoint::new("grid-power", "Grid power", ValueType::Number),
            }],
        );
        let mut state = EngineContext::new();
        part.run(&mut state).unwrap();
        assert!(state.get_datapoint("grid-power").is_none());

        state.set_datapoint(
            Datapoint::new("meter-1/power", "Power", ValueType::Number),
            DatapointState::number("meter-1/power", 7, -320.0),
        );
        part.run(&mut state).unwrap();
        let mapped = state.get_datapoint("grid-power").unwrap();
        assert_eq!(mapped.state.id, "grid-power");
        assert_eq!(mapped.state.at, 7);
        assert_eq!(mapped.state.value_num, Some(-320.0));
        assert_eq!(mapped.datapoint.name, "Grid power");
    }
}
