//! Calculated datapoints

use std::collections::HashMap;
use std::sync::Arc;

use castle_types::{Datapoint, DatapointState, EngineContext, ValueType, now_ms};
use chrono::DateTime;
use rhai::{AST, Dynamic};

use super::engine::as_number;
use super::{ExpressionEngine, ExpressionError, References};

/// Observed `(first.at, last.at)` of a sequence
type SequenceMark = Option<(i64, i64)>;

/// A datapoint whose value is an expression over other datapoints
pub struct DatapointCalculator {
    datapoint: Datapoint,
    code: String,
    engine: Arc<ExpressionEngine>,
    ast: AST,
    references: References,
    seen_datapoints: HashMap<String, Option<i64>>,
    seen_sequences: HashMap<String, SequenceMark>,
    calculated: bool,
}

impl DatapointCalculator {
    /// Compile `code` and discover what it references
    pub fn new(
        engine: Arc<ExpressionEngine>,
        datapoint: Datapoint,
        code: impl Into<String>,
    ) -> Result<Self, ExpressionError> {
        let code = code.into();
        let ast = engine.compile(&code)?;
        let references = engine.discover(&ast);
        tracing::debug!(
            datapoint = %datapoint.id,
            datapoints = ?references.datapoints,
            sequences = ?references.sequences,
            "Expression references discovered"
        );
        Ok(Self {
            datapoint,
            code,
            engine,
            ast,
            references,
            seen_datapoints: HashMap::new(),
            seen_sequences: HashMap::new(),
            calculated: false,
        })
    }

    pub fn datapoint(&self) -> &Datapoint {
        &self.datapoint
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn references(&self) -> &References {
        &self.references
    }

    /// Whether any referenced input changed since the last calculation
    ///
    /// Always true before the first calculation.
    pub fn check_should_recalculate(&self, context: &EngineContext) -> bool {
        if !self.calculated {
            return true;
        }
        let datapoint_changed = self.references.datapoints.iter().any(|id| {
            self.seen_datapoints.get(id).copied().flatten() != datapoint_mark(context, id)
        });
        datapoint_changed
            || self.references.sequences.iter().any(|id| {
                self.seen_sequences.get(id).copied().flatten() != sequence_mark(context, id)
            })
    }

    /// Evaluate against `context` and coerce to the datapoint's type
    ///
    /// The inputs are marked as seen even when evaluation fails, so a failing
    /// expression is retried only once its inputs change.
    pub fn calculate(
        &mut self,
        context: &Arc<EngineContext>,
    ) -> Result<DatapointState, ExpressionError> {
        for id in &self.references.datapoints {
            self.seen_datapoints
                .insert(id.clone(), datapoint_mark(context, id));
        }
        for id in &self.references.sequences {
            self.seen_sequences
                .insert(id.clone(), sequence_mark(context, id));
        }
        self.calculated = true;

        let value = self.engine.evaluate(&self.ast, context)?;
        coerce(&self.datapoint, now_ms(), value)
    }
}

fn datapoint_mark(context: &EngineContext, id: &str) -> Option<i64> {
    context.get_state(id).map(|state| state.at)
}

fn sequence_mark(context: &EngineContext, id: &str) -> SequenceMark {
    let state = &context.get_sequence(id)?.state;
    Some((state.first()?.at, state.last()?.at))
}

/// Convert an expression result into a state of `datapoint`
pub fn coerce(
    datapoint: &Datapoint,
    at: i64,
    value: Dynamic,
) -> Result<DatapointState, ExpressionError> {
    let id = datapoint.id.as_str();
    if value.is_unit() {
        return Ok(DatapointState::empty(id, at));
    }

    let state = match datapoint.value_type {
        ValueType::Number => as_number(&value).map(|n| DatapointState::number(id, at, n)),
        ValueType::String => value
            .clone()
            .into_string()
            .ok()
            .map(|s| DatapointState::string(id, at, s)),
        ValueType::Boolean => {
            if let Ok(b) = value.as_bool() {
                Some(DatapointState::boolean(id, at, b))
            } else if let Some(n) = as_number(&value) {
                Some(DatapointState::boolean(id, at, n != 0.0))
            } else {
                match value.clone().into_string().ok().as_deref() {
                    Some("true") => Some(DatapointState::boolean(id, at, true)),
                    Some("false") => Some(DatapointState::boolean(id, at, false)),
                    _ => None,
                }
            }
        }
        ValueType::Date => {
            if let Some(n) = as_number(&value) {
                Some(DatapointState::date(id, at, n as i64))
            } else {
                value
                    .clone()
                    .into_string()
                    .ok()
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|d| DatapointState::date(id, at, d.timestamp_millis()))
            }
        }
    };

    state.ok_or_else(|| ExpressionError::TypeMismatch {
        datapoint: datapoint.id.clone(),
        expected: datapoint.value_type,
        actual: value.type_name().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number(id: &str) -> Datapoint {
        Datapoint::new(id, id, ValueType::Number)
    }

    fn calculator(code: &str) -> DatapointCalculator {
        DatapointCalculator::new(Arc::new(ExpressionEngine::new()), number("out"), code).unwrap()
    }

    #[test]
    fn test_recalculates_only_on_input_change() {
        let mut calc = calculator("get(\"a\") + get(\"b\")");
        let mut ctx = EngineContext::new();
        ctx.set_datapoint(number("a"), DatapointState::number("a", 1, 2.0));
        ctx.set_datapoint(number("b"), DatapointState::number("b", 1, 3.0));
        ctx.set_datapoint(number("other"), DatapointState::number("other", 1, 0.0));

        assert!(calc.check_should_recalculate(&ctx));
        let shared = Arc::new(ctx);
        let state = calc.calculate(&shared).unwrap();
        let mut ctx = Arc::unwrap_or_clone(shared);
        assert_eq!(state.value_num, Some(5.0));
        assert!(!calc.check_should_recalculate(&ctx));

        // Unreferenced datapoints do not matter
        ctx.set_datapoint(number("other"), DatapointState::number("other", 2, 1.0));
        assert!(!calc.check_should_recalculate(&ctx));

        ctx.set_datapoint(number("b"), DatapointState::number("b", 2, 3.0));
        assert!(calc.check_should_recalculate(&ctx));
    }

    #[test]
    fn test_first_check_with_no_references() {
        let calc = calculator("42");
        assert!(calc.references().datapoints.is_empty());
        assert!(calc.check_should_recalculate(&EngineContext::new()));
    }

    #[test]
    fn test_unit_result_is_empty_state() {
        let mut calc = calculator("get(\"missing\")");
        let state = calc.calculate(&Arc::new(EngineContext::new())).unwrap();
        assert!(!state.has_value());
        assert!(state.error.is_none());
    }

    #[test]
    fn test_coerce_type_mismatch() {
        let result = coerce(&number("n"), 1, Dynamic::from("text".to_string()));
        assert!(matches!(result, Err(ExpressionError::TypeMismatch { .. })));

        let flag = Datapoint::new("f", "f", ValueType::Boolean);
        let state = coerce(&flag, 1, Dynamic::from_int(1)).unwrap();
        assert_eq!(state.as_bool(), Some(true));

        let date = Datapoint::new("d", "d", ValueType::Date);
        let state = coerce(&date, 1, Dynamic::from("1970-01-01T00:00:01Z".to_string())).unwrap();
        assert_eq!(state.value_num, Some(1000.0));
    }

    #[test]
    fn test_compile_error() {
        let result =
            DatapointCalculator::new(Arc::new(ExpressionEngine::new()), number("x"), "get(");
        assert!(matches!(result, Err(ExpressionError::Compile { .. })));
    }
}
