//! Castle - device automation system
//!
//! This crate assembles the lap pipeline of `castle_runtime` into a running
//! system:
//! - Configuration loading and validation
//! - Device types, instances and the device registry
//! - Persistence backends for the datapoint and control logs
//! - Mail senders for notifications
//! - The `CastleAcDc` orchestrator and its `SystemHandle`

// Re-export core crates
pub use castle_runtime;
pub use castle_types;

// Configuration documents
pub mod config;

// Device abstraction and drivers
pub mod devices;

// Datapoint and control logs
pub mod persistence;

// Notifications
pub mod mail;

// Orchestrator
pub mod system;

pub use system::{CastleAcDc, SystemError, SystemHandle, SystemStatus};
