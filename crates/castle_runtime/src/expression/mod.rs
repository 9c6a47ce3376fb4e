//! Expression evaluation for calculated datapoints
//!
//! Expressions are rhai expressions with a fixed set of context functions:
//!
//! | Function | Description |
//! |----------|-------------|
//! | `get(id)` | Current value of a datapoint, `()` if unknown |
//! | `isDef(a, ...)` | Whether all of 1-3 values are defined |
//! | `seqDuration(seq, unit)` | Span between first and last sample |
//! | `seqFind(which, seq, value, aspect)` | First/last sample matching a value |
//! | `seqIntegral(seq, unit)` | Trapezoid integral of a numeric sequence |
//! | `valueForRange(value, limits, values, ifNone)` | Bucket lookup |
//!
//! Referenced datapoints and sequences are discovered by a dry run at
//! construction time.

mod calculator;
mod engine;
pub mod functions;

pub use calculator::*;
pub use engine::*;

use castle_types::ValueType;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("Failed to compile `{code}`: {message}")]
    Compile { code: String, message: String },

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Datapoint {datapoint} expects a {expected} value, expression returned {actual}")]
    TypeMismatch {
        datapoint: String,
        expected: ValueType,
        actual: String,
    },
}
