//! Castle Runtime - Engines of the automation pipeline
//!
//! This crate contains the engines that form the lap pipeline
//! (datacollector → datastate → control → persist), the part traits they
//! run, the built-in datastate and control parts, and the expression
//! evaluator used for calculated datapoints.

pub use castle_types;

pub mod control;
pub mod datacollector;
pub mod datastate;
pub mod engine;
pub mod expression;
pub mod parts;
pub mod persist;

pub use control::{ControlEngine, DeviceController};
pub use datacollector::DatacollectorEngine;
pub use datastate::DatastateEngine;
pub use engine::{Engine, EngineError, EngineKind, EngineResult, EngineStatus};
pub use persist::PersistEngine;
