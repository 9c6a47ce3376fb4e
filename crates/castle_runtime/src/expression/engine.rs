//! Rhai engine with the context functions registered
//!
//! The registered functions read from a shared binding. During a dry run the
//! binding records every datapoint and sequence id that is asked for; during
//! evaluation it holds the context the expression runs against.

use std::collections::BTreeSet;
use std::sync::Arc;

use castle_types::{DatapointState, EngineContext, ValueType};
use parking_lot::Mutex;
use rhai::{AST, Array, Dynamic, Engine, EvalAltResult};
use serde::Serialize;

use super::ExpressionError;
use super::functions::{self, Aspect, Which};

/// Operations allowed per evaluation
pub const MAX_OPERATIONS: u64 = 10_000;

type FnResult = Result<Dynamic, Box<EvalAltResult>>;

/// Datapoint and sequence ids an expression reads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct References {
    pub datapoints: BTreeSet<String>,
    pub sequences: BTreeSet<String>,
}

enum Binding {
    Idle,
    Recording(References),
    Live(Arc<EngineContext>),
}

impl Binding {
    fn get(&mut self, id: &str) -> Dynamic {
        match self {
            Binding::Idle => Dynamic::UNIT,
            Binding::Recording(refs) => {
                refs.datapoints.insert(id.to_string());
                Dynamic::from_float(0.0)
            }
            Binding::Live(context) => context
                .get_datapoint(id)
                .map(|entry| state_value(entry.datapoint.value_type, &entry.state))
                .unwrap_or(Dynamic::UNIT),
        }
    }

    /// Look up a sequence, recording the id during a dry run
    ///
    /// `Err` carries the stand-in result of the dry run.
    fn sequence<'a>(
        &'a mut self,
        id: &str,
    ) -> Result<Option<(&'a castle_types::ContextSequence, &'a EngineContext)>, Dynamic> {
        match self {
            Binding::Idle => Err(Dynamic::UNIT),
            Binding::Recording(refs) => {
                refs.sequences.insert(id.to_string());
                Err(Dynamic::from_float(0.0))
            }
            Binding::Live(context) => {
                let context: &'a EngineContext = &**context;
                Ok(context.get_sequence(id).map(move |seq| (seq, context)))
            }
        }
    }

    fn seq_duration(&mut self, id: &str, unit: &str) -> FnResult {
        let unit_ms = parse_unit(unit)?;
        Ok(match self.sequence(id) {
            Err(stand_in) => stand_in,
            Ok(None) => Dynamic::UNIT,
            Ok(Some((entry, _))) => {
                Dynamic::from_float(functions::seq_duration(&entry.state, unit_ms))
            }
        })
    }

    fn seq_find(&mut self, which: &str, id: &str, needle: Dynamic, aspect: &str) -> FnResult {
        let which: Which = which.parse()?;
        let aspect: Aspect = aspect.parse()?;
        let (entry, context) = match self.sequence(id) {
            Err(stand_in) => return Ok(stand_in),
            Ok(None) => return Ok(Dynamic::UNIT),
            Ok(Some(found)) => found,
        };
        let found = functions::seq_find(&entry.state, which, |s| matches_needle(s, &needle));
        Ok(match (found, aspect) {
            (None, _) => Dynamic::UNIT,
            (Some(sample), Aspect::At) => Dynamic::from_float(sample.at as f64),
            (Some(sample), Aspect::Value) => {
                let value_type = context
                    .get_datapoint(&entry.sequence.datapoint_id)
                    .map(|dp| dp.datapoint.value_type);
                sample_value(value_type, sample)
            }
        })
    }

    fn seq_integral(&mut self, id: &str, unit: &str) -> FnResult {
        let unit_ms = parse_unit(unit)?;
        match self.sequence(id) {
            Err(stand_in) => Ok(stand_in),
            Ok(None) => Ok(Dynamic::UNIT),
            Ok(Some((entry, _))) => functions::seq_integral(&entry.state, unit_ms)
                .map(Dynamic::from_float)
                .map_err(Into::into),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value conversion
// ─────────────────────────────────────────────────────────────────────────────

fn parse_unit(unit: &str) -> Result<f64, Box<EvalAltResult>> {
    functions::unit_ms(unit).ok_or_else(|| format!("unknown duration unit \"{unit}\"").into())
}

/// Value of a state as seen by expressions
pub fn state_value(value_type: ValueType, state: &DatapointState) -> Dynamic {
    let value = match value_type {
        ValueType::Number | ValueType::Date => state.value_num.map(Dynamic::from_float),
        ValueType::String => state.value_string.clone().map(Dynamic::from),
        ValueType::Boolean => state.as_bool().map(Dynamic::from_bool),
    };
    value.unwrap_or(Dynamic::UNIT)
}

fn sample_value(value_type: Option<ValueType>, state: &DatapointState) -> Dynamic {
    match value_type {
        Some(value_type) => state_value(value_type, state),
        None => match (&state.value_num, &state.value_string) {
            (Some(n), _) => Dynamic::from_float(*n),
            (None, Some(s)) => Dynamic::from(s.clone()),
            (None, None) => Dynamic::UNIT,
        },
    }
}

pub(crate) fn as_number(value: &Dynamic) -> Option<f64> {
    if let Ok(f) = value.as_float() {
        return Some(f);
    }
    value.as_int().ok().map(|i| i as f64)
}

fn matches_needle(state: &DatapointState, needle: &Dynamic) -> bool {
    if let Some(n) = as_number(needle) {
        state.value_num == Some(n)
    } else if let Ok(b) = needle.as_bool() {
        state.as_bool() == Some(b)
    } else if let Ok(s) = needle.clone().into_string() {
        state.value_string.as_deref() == Some(s.as_str())
    } else {
        false
    }
}

/// `()` and NaN are undefined
pub(crate) fn is_defined(value: &Dynamic) -> bool {
    if value.is_unit() {
        return false;
    }
    !value.as_float().is_ok_and(f64::is_nan)
}

/// `()`, `false`, `0`, NaN and `""` count as no value
fn is_falsy(value: &Dynamic) -> bool {
    if value.is_unit() {
        return true;
    }
    if let Ok(b) = value.as_bool() {
        return !b;
    }
    if let Some(n) = as_number(value) {
        return n == 0.0 || n.is_nan();
    }
    if let Ok(s) = value.clone().into_string() {
        return s.is_empty();
    }
    false
}

/// Pick `values[i]` for the highest `limits[i] <= value`, else `if_none`
pub fn value_for_range(value: Dynamic, limits: Array, values: Array, if_none: Dynamic) -> Dynamic {
    if is_falsy(&value) {
        return if_none;
    }
    let Some(value) = as_number(&value) else {
        return if_none;
    };
    let Some(limits) = limits.iter().map(as_number).collect::<Option<Vec<f64>>>() else {
        return if_none;
    };
    functions::range_index(value, &limits)
        .and_then(|i| values.get(i).cloned())
        .unwrap_or(if_none)
}

// ─────────────────────────────────────────────────────────────────────────────
// Expression Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Sandboxed rhai engine shared by the calculators of one part
pub struct ExpressionEngine {
    engine: Engine,
    binding: Arc<Mutex<Binding>>,
    /// Held for the whole of a dry run or evaluation
    session: Mutex<()>,
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEngine {
    pub fn new() -> Self {
        let binding = Arc::new(Mutex::new(Binding::Idle));
        let mut engine = Engine::new();

        engine.on_progress(|count| {
            if count > MAX_OPERATIONS {
                Some(format!("Safety limit exceeded: maximum {MAX_OPERATIONS} operations").into())
            } else {
                None
            }
        });
        engine.set_max_expr_depths(64, 32);
        engine.disable_symbol("eval");

        register_functions(&mut engine, &binding);

        Self {
            engine,
            binding,
            session: Mutex::new(()),
        }
    }

    pub fn compile(&self, code: &str) -> Result<AST, ExpressionError> {
        self.engine
            .compile_expression(code)
            .map_err(|e| ExpressionError::Compile {
                code: code.to_string(),
                message: e.to_string(),
            })
    }

    /// Dry-run `ast` and collect the ids it reads
    ///
    /// Evaluation errors end the dry run early and are ignored.
    pub fn discover(&self, ast: &AST) -> References {
        let _session = self.session.lock();
        *self.binding.lock() = Binding::Recording(References::default());
        if let Err(e) = self.engine.eval_ast::<Dynamic>(ast) {
            tracing::trace!(error = %e, "Dry run stopped early");
        }
        match std::mem::replace(&mut *self.binding.lock(), Binding::Idle) {
            Binding::Recording(references) => references,
            _ => References::default(),
        }
    }

    /// Evaluate `ast` against `context`
    ///
    /// The binding holds a second reference to `context` only while the
    /// evaluation runs.
    pub fn evaluate(
        &self,
        ast: &AST,
        context: &Arc<EngineContext>,
    ) -> Result<Dynamic, ExpressionError> {
        let _session = self.session.lock();
        *self.binding.lock() = Binding::Live(Arc::clone(context));
        let result = self.engine.eval_ast::<Dynamic>(ast);
        *self.binding.lock() = Binding::Idle;
        result.map_err(|e| ExpressionError::Evaluation(e.to_string()))
    }
}

fn register_functions(engine: &mut Engine, binding: &Arc<Mutex<Binding>>) {
    let b = Arc::clone(binding);
    engine.register_fn("get", move |id: &str| b.lock().get(id));

    engine.register_fn("isDef", |a: Dynamic| is_defined(&a));
    engine.register_fn("isDef", |a: Dynamic, b: Dynamic| {
        is_defined(&a) && is_defined(&b)
    });
    engine.register_fn("isDef", |a: Dynamic, b: Dynamic, c: Dynamic| {
        is_defined(&a) && is_defined(&b) && is_defined(&c)
    });

    let b = Arc::clone(binding);
    engine.register_fn("seqDuration", move |id: &str, unit: &str| {
        b.lock().seq_duration(id, unit)
    });

    let b = Arc::clone(binding);
    engine.register_fn(
        "seqFind",
        move |which: &str, id: &str, value: Dynamic, aspect: &str| {
            b.lock().seq_find(which, id, value, aspect)
        },
    );

    let b = Arc::clone(binding);
    engine.register_fn("seqIntegral", move |id: &str, unit: &str| {
        b.lock().seq_integral(id, unit)
    });

    engine.register_fn("valueForRange", value_for_range);
}
