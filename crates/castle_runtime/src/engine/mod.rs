//! Engine Lifecycle
//!
//! Engines are long-running components of the pipeline. Each one runs laps,
//! keeps lap bookkeeping (counter, durations, error log) and notifies its
//! consumers when a lap ends.
//!
//! # Lifecycle
//!
//! - `start`: sets `should_run` and spawns background work if the engine has any
//! - `stop`: clears `should_run` and waits for the in-flight lap to finish;
//!   an engine that does not go idle in time reports `StopTimeout`
//! - `status` / `settings` / `snapshot`: read-only views, callable while a lap runs

mod consumer;
mod lap;

pub use consumer::*;
pub use lap::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Engine Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur during engine lifecycle
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Engine already running: {0}")]
    AlreadyRunning(String),

    #[error("Engine not running: {0}")]
    NotRunning(String),

    #[error("Engine {engine} did not stop within {waited_ms}ms")]
    StopTimeout { engine: String, waited_ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

// ─────────────────────────────────────────────────────────────────────────────
// Engine Kind & Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// The concrete variant behind an `Engine`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    Datacollector,
    Datastate,
    Control,
    Persist,
    Persistence,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Datacollector => write!(f, "datacollector"),
            EngineKind::Datastate => write!(f, "datastate"),
            EngineKind::Control => write!(f, "control"),
            EngineKind::Persist => write!(f, "persist"),
            EngineKind::Persistence => write!(f, "persistence"),
        }
    }
}

/// Serializable view of an engine
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub key: String,
    pub kind: EngineKind,
    pub status: EngineStatus,
    pub settings: serde_json::Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A long-running subsystem of the pipeline
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Configuration key of the engine
    fn key(&self) -> &str;

    fn kind(&self) -> EngineKind;

    /// Start running laps
    async fn start(&self) -> EngineResult<()>;

    /// Stop running laps and wait for the in-flight lap to end
    async fn stop(&self) -> EngineResult<()>;

    fn status(&self) -> EngineStatus;

    fn settings(&self) -> serde_json::Value;

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            key: self.key().to_string(),
            kind: self.kind(),
            status: self.status(),
            settings: self.settings(),
        }
    }
}
