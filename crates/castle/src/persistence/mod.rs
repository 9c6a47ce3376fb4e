//! Persistence
//!
//! Backends store three logs: `datapoint_log` (states of datapoints as they
//! changed), `datapoint_control_log` (values sent to devices) and the sample
//! log (named recordings: `sample` with its `sample_datapoint`s and the
//! `sample_data_log` of their values). Persist engines write to them through
//! the parts made by a `PersistenceEngine`.

mod engine;
mod memory;
mod parts;
mod redb_store;

pub use engine::PersistenceEngine;
pub use memory::MemoryPersistence;
pub use parts::{ControlLogPart, DatapointLogPart, SampleLogPart, SampleMember};
pub use redb_store::RedbPersistence;

use async_trait::async_trait;
use castle_types::{DatapointState, DatapointTarget, ExecutedRequest, ValueType};
use serde::{Deserialize, Serialize};

/// Errors that can occur in a persistence backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistenceError {
    #[error("Persistence not connected: {0}")]
    NotConnected(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Half-open range `[from, to)` of unix milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: i64,
    pub to: i64,
}

impl TimeRange {
    pub fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, at: i64) -> bool {
        self.from <= at && at < self.to
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rows
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatapointLogRow {
    pub datapoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_num: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    pub changed_at: i64,
}

impl From<&DatapointState> for DatapointLogRow {
    fn from(state: &DatapointState) -> Self {
        Self {
            datapoint_id: state.id.clone(),
            value_num: state.value_num,
            value_string: state.value_string.clone(),
            changed_at: state.at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlLogRow {
    pub device_id: String,
    pub datapoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_num: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    /// The request reached the device
    pub executed: bool,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logged_at: i64,
}

impl ControlLogRow {
    pub fn new(target: &DatapointTarget, request: &ExecutedRequest) -> Self {
        Self {
            device_id: target.target.device_id.clone(),
            datapoint_id: target.target.datapoint_id.clone(),
            value_num: target.state.value_num,
            value_string: target.state.value_string.clone(),
            executed: request.executed,
            success: request.success,
            error: request.error.clone(),
            logged_at: request.at,
        }
    }
}

/// A named recording of a set of datapoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub sample_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Recording length; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_ms: Option<i64>,
    #[serde(default)]
    pub datapoints: Vec<SampleDatapoint>,
}

/// Metadata of a datapoint recorded in a sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleDatapoint {
    pub datapoint_id: String,
    pub name: String,
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// What the datapoint stands for in the recording, e.g. "outdoor"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meaning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleDataRow {
    pub sample_id: String,
    pub datapoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_num: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    pub changed_at: i64,
}

impl SampleDataRow {
    pub fn new(sample_id: impl Into<String>, datapoint_id: impl Into<String>, state: &DatapointState) -> Self {
        Self {
            sample_id: sample_id.into(),
            datapoint_id: datapoint_id.into(),
            value_num: state.value_num,
            value_string: state.value_string.clone(),
            changed_at: state.at,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Storage for the datapoint, control and sample logs
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Backend type name, for status output
    fn kind(&self) -> &'static str;

    async fn connect(&self) -> PersistenceResult<()>;

    async fn insert_datapoint_rows(&self, rows: Vec<DatapointLogRow>) -> PersistenceResult<()>;

    /// Rows with `changedAt` in `range`, oldest first
    async fn select_datapoint_rows(
        &self,
        range: TimeRange,
    ) -> PersistenceResult<Vec<DatapointLogRow>>;

    async fn insert_control_rows(&self, rows: Vec<ControlLogRow>) -> PersistenceResult<()>;

    /// Rows with `loggedAt` in `range`, oldest first
    async fn select_control_rows(&self, range: TimeRange) -> PersistenceResult<Vec<ControlLogRow>>;

    /// Create or replace a sample together with its datapoints
    async fn upsert_sample(&self, sample: Sample) -> PersistenceResult<()>;

    /// All samples, ordered by id
    async fn select_samples(&self) -> PersistenceResult<Vec<Sample>>;

    async fn insert_sample_rows(&self, rows: Vec<SampleDataRow>) -> PersistenceResult<()>;

    /// Rows of one sample with `changedAt` in `range`, oldest first
    async fn select_sample_rows(
        &self,
        sample_id: &str,
        range: TimeRange,
    ) -> PersistenceResult<Vec<SampleDataRow>>;

    async fn disconnect(&self) -> PersistenceResult<()>;
}
