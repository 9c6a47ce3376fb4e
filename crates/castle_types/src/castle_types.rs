//! Castle Types - Core data model for the engine pipeline
//!
//! This crate contains the pure data structures exchanged between engines:
//! datapoints and their timestamped states, bounded sequences, the
//! `EngineContext` snapshot and the per-engine `ControlContext`.
//!
//! Nothing in here performs I/O; all operations are infallible.

mod context;
mod control;
mod datapoint;
mod device;
mod sequence;

pub use context::*;
pub use control::*;
pub use datapoint::*;
pub use device::*;
pub use sequence::*;
