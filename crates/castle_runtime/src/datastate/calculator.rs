use std::sync::Arc;

use castle_types::EngineContext;

use crate::expression::DatapointCalculator;
use crate::parts::{DatastatePart, PartError, PartResult};

/// Runs calculators in order; later calculators see earlier results
pub struct CalculatorPart {
    name: String,
    calculators: Vec<DatapointCalculator>,
}

impl CalculatorPart {
    pub fn new(name: impl Into<String>, calculators: Vec<DatapointCalculator>) -> Self {
        Self {
            name: name.into(),
            calculators,
        }
    }

    pub fn calculators(&self) -> &[DatapointCalculator] {
        &self.calculators
    }
}

impl DatastatePart for CalculatorPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, state: &mut EngineContext) -> PartResult {
        let mut errors = Vec::new();
        // Evaluations share the context; writes copy it only while shared
        let mut shared = Arc::new(std::mem::take(state));
        for calculator in &mut self.calculators {
            if !calculator.check_should_recalculate(&shared) {
                continue;
            }
            match calculator.calculate(&shared) {
                Ok(value) => {
                    Arc::make_mut(&mut shared).set_datapoint(calculator.datapoint().clone(), value)
                }
                Err(e) => errors.push(format!("{}: {e}", calculator.datapoint().id)),
            }
        }
        *state = Arc::unwrap_or_clone(shared);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PartError::new(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::ExpressionEngine;
    use castle_types::{Datapoint, DatapointState, ValueType};

    fn number(id: &str) -> Datapoint {
        Datapoint::new(id, id, ValueType::Number)
    }

    #[test]
    fn test_chained_calculators() {
        let engine = Arc::new(ExpressionEngine::new());
        let surplus = DatapointCalculator::new(
            Arc::clone(&engine),
            number("surplus"),
            "get(\"production\") - get(\"consumption\")",
        )
        .unwrap();
        let exporting = DatapointCalculator::new(
            Arc::clone(&engine),
            Datapoint::new("exporting", "Exporting", ValueType::Boolean),
            "get(\"surplus\") > 0.0",
        )
        .unwrap();
        let mut part = CalculatorPart::new("calc", vec![surplus, exporting]);

        let mut state = EngineContext::new();
        state.set_datapoint(number("production"), DatapointState::number("production", 1, 3000.0));
        state.set_datapoint(number("consumption"), DatapointState::number("consumption", 1, 1200.0));
        part.run(&mut state).unwrap();

        assert_eq!(state.get_state("surplus").and_then(|s| s.value_num), Some(1800.0));
        assert_eq!(state.get_state("exporting").and_then(|s| s.as_bool()), Some(true));
    }

    #[test]
    fn test_errors_do_not_stop_other_calculators() {
        let engine = Arc::new(ExpressionEngine::new());
        let broken = DatapointCalculator::new(
            Arc::clone(&engine),
            number("broken"),
            "seqIntegral(\"s\", \"parsecs\")",
        )
        .unwrap();
        let fine =
            DatapointCalculator::new(Arc::clone(&engine), number("fine"), "1.5").unwrap();
        let mut part = CalculatorPart::new("calc", vec![broken, fine]);

        let mut state = EngineContext::new();
        let result = part.run(&mut state);
        assert!(result.unwrap_err().0.starts_with("broken:"));
        assert_eq!(state.get_state("fine").and_then(|s| s.value_num), Some(1.5));
        assert!(state.get_datapoint("broken").is_none());
    }
}
