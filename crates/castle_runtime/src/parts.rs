//! Part contracts
//!
//! Engines do their work through parts. A part failure is reported as a
//! `PartError`, logged against the lap, and never stops the remaining parts.

use async_trait::async_trait;
use castle_types::{ControlContext, EngineContext};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Error reported by a single part run
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct PartError(pub String);

impl PartError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for PartError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for PartError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

pub type PartResult = Result<(), PartError>;

/// Channel on which a datacollector part pushes unsolicited updates
pub type PushSink = mpsc::UnboundedSender<EngineContext>;

/// Fetches device data for the datacollector
#[async_trait]
pub trait DatacollectorPart: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch and write the collected states into `updates`
    async fn run(&self, updates: &mut EngineContext) -> PartResult;

    /// Hand the part a sink for pushed updates
    ///
    /// Returns whether the part will push. The default part never pushes.
    fn register_push(&self, _sink: PushSink) -> bool {
        false
    }
}

/// Derives state inside the datastate engine
pub trait DatastatePart: Send {
    fn name(&self) -> &str;

    fn run(&mut self, state: &mut EngineContext) -> PartResult;
}

/// A control action triggered outside of the lap cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlAction {
    pub id: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ControlAction {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            params: serde_json::Value::Null,
        }
    }
}

/// Control rule run by a control engine
///
/// Parts never talk to devices; they propose targets on the control context.
#[async_trait]
pub trait ControlPart: Send {
    fn name(&self) -> &str;

    async fn run(&mut self, context: &EngineContext, control: &mut ControlContext) -> PartResult;

    /// Handle a direct action; `None` if the part does not handle actions
    async fn run_for_action(
        &mut self,
        _action: &ControlAction,
        _context: &EngineContext,
        _control: &mut ControlContext,
    ) -> Option<PartResult> {
        None
    }
}

/// Persists engine contexts
#[async_trait]
pub trait ContextPersistPart: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, context: &EngineContext) -> PartResult;
}

/// Persists control contexts
#[async_trait]
pub trait ControlPersistPart: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, control: &ControlContext) -> PartResult;
}
