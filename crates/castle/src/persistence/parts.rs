//! Persist parts writing to a persistence backend

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use castle_runtime::parts::{ContextPersistPart, ControlPersistPart, PartError, PartResult};
use castle_types::{ControlContext, EngineContext, now_ms};
use parking_lot::Mutex;
use tracing::info;
use wildmatch::WildMatch;

use super::{ControlLogRow, DatapointLogRow, Persistence, Sample, SampleDataRow, SampleDatapoint};

/// Logs datapoints whose id matches one of the patterns
///
/// Only states not logged before are written: a datapoint is logged again
/// once its `at` moved on. This covers the news of a datastate context and
/// everything calculated from it.
pub struct DatapointLogPart {
    name: String,
    persistence: Arc<dyn Persistence>,
    patterns: Vec<WildMatch>,
    logged: Mutex<HashMap<String, i64>>,
}

impl DatapointLogPart {
    pub fn new(
        name: impl Into<String>,
        persistence: Arc<dyn Persistence>,
        patterns: &[String],
    ) -> Self {
        Self {
            name: name.into(),
            persistence,
            patterns: patterns.iter().map(|p| WildMatch::new(p)).collect(),
            logged: Mutex::new(HashMap::new()),
        }
    }

    pub fn matches(&self, id: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(id))
    }

    /// Rows for the states of `context` that were not logged yet
    pub fn pending_rows(&self, context: &EngineContext) -> Vec<DatapointLogRow> {
        let logged = self.logged.lock();
        let mut rows: Vec<DatapointLogRow> = context
            .datapoints()
            .filter(|entry| entry.state.has_value() && self.matches(&entry.datapoint.id))
            .filter(|entry| logged.get(&entry.datapoint.id) != Some(&entry.state.at))
            .map(|entry| DatapointLogRow {
                datapoint_id: entry.datapoint.id.clone(),
                ..DatapointLogRow::from(&entry.state)
            })
            .collect();
        rows.sort_by(|a, b| a.datapoint_id.cmp(&b.datapoint_id));
        rows
    }

    fn mark_logged(&self, rows: &[DatapointLogRow]) {
        let mut logged = self.logged.lock();
        for row in rows {
            logged.insert(row.datapoint_id.clone(), row.changed_at);
        }
    }
}

#[async_trait]
impl ContextPersistPart for DatapointLogPart {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, context: &EngineContext) -> PartResult {
        let rows = self.pending_rows(context);
        if rows.is_empty() {
            return Ok(());
        }
        self.persistence
            .insert_datapoint_rows(rows.clone())
            .await
            .map_err(|e| PartError::new(e.to_string()))?;
        self.mark_logged(&rows);
        Ok(())
    }
}

/// Logs every target of the executed requests of a control lap
pub struct ControlLogPart {
    name: String,
    persistence: Arc<dyn Persistence>,
}

impl ControlLogPart {
    pub fn new(name: impl Into<String>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            name: name.into(),
            persistence,
        }
    }

    pub fn rows(control: &ControlContext) -> Vec<ControlLogRow> {
        control
            .executed_requests()
            .flat_map(|executed| {
                executed
                    .request
                    .targets
                    .iter()
                    .map(|target| ControlLogRow::new(target, executed))
            })
            .collect()
    }
}

#[async_trait]
impl ControlPersistPart for ControlLogPart {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, control: &ControlContext) -> PartResult {
        let rows = Self::rows(control);
        if rows.is_empty() {
            return Ok(());
        }
        self.persistence
            .insert_control_rows(rows)
            .await
            .map_err(|e| PartError::new(e.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sample log
// ─────────────────────────────────────────────────────────────────────────────

/// Datapoint of a sample as configured, before its metadata is known
#[derive(Debug, Clone, PartialEq)]
pub struct SampleMember {
    pub datapoint_id: String,
    pub description: Option<String>,
    pub meaning: Option<String>,
}

#[derive(Default)]
struct Recording {
    /// Set once the sample is stored
    started_at: Option<i64>,
    logged: HashMap<String, i64>,
}

/// Records the states of a fixed set of datapoints into a named sample
///
/// The sample is stored on the first run that sees all of its datapoints,
/// taking name, type and unit from the context. From then on every new
/// state is logged until `length_ms` has passed.
pub struct SampleLogPart {
    name: String,
    persistence: Arc<dyn Persistence>,
    sample: Sample,
    members: Vec<SampleMember>,
    recording: Mutex<Recording>,
}

impl SampleLogPart {
    pub fn new(
        name: impl Into<String>,
        persistence: Arc<dyn Persistence>,
        sample: Sample,
        members: Vec<SampleMember>,
    ) -> Self {
        Self {
            name: name.into(),
            persistence,
            sample,
            members,
            recording: Mutex::new(Recording::default()),
        }
    }

    pub fn sample_id(&self) -> &str {
        &self.sample.sample_id
    }

    /// The sample with metadata taken from `context`, if every member is known
    fn describe(&self, context: &EngineContext) -> Option<Sample> {
        let datapoints = self
            .members
            .iter()
            .map(|member| {
                let entry = context.get_datapoint(&member.datapoint_id)?;
                Some(SampleDatapoint {
                    datapoint_id: member.datapoint_id.clone(),
                    name: entry.datapoint.name.clone(),
                    value_type: entry.datapoint.value_type,
                    value_unit: entry.datapoint.value_unit.clone(),
                    description: member.description.clone(),
                    meaning: member.meaning.clone(),
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Sample {
            datapoints,
            ..self.sample.clone()
        })
    }

    fn is_over(&self, started_at: i64, now: i64) -> bool {
        self.sample
            .length_ms
            .is_some_and(|length| now - started_at >= length)
    }

    fn pending_rows(&self, context: &EngineContext, recording: &Recording) -> Vec<SampleDataRow> {
        self.members
            .iter()
            .filter_map(|member| context.get_datapoint(&member.datapoint_id))
            .filter(|entry| entry.state.has_value())
            .filter(|entry| recording.logged.get(&entry.datapoint.id) != Some(&entry.state.at))
            .map(|entry| SampleDataRow::new(&self.sample.sample_id, &entry.datapoint.id, &entry.state))
            .collect()
    }
}

#[async_trait]
impl ContextPersistPart for SampleLogPart {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, context: &EngineContext) -> PartResult {
        let now = now_ms();
        let started_at = self.recording.lock().started_at;
        let started_at = match started_at {
            Some(started_at) => started_at,
            None => {
                let Some(sample) = self.describe(context) else {
                    return Ok(());
                };
                self.persistence
                    .upsert_sample(sample)
                    .await
                    .map_err(|e| PartError::new(e.to_string()))?;
                info!(part = %self.name, sample = %self.sample.sample_id, "Sample recording started");
                self.recording.lock().started_at = Some(now);
                now
            }
        };
        if self.is_over(started_at, now) {
            return Ok(());
        }

        let rows = self.pending_rows(context, &self.recording.lock());
        if rows.is_empty() {
            return Ok(());
        }
        self.persistence
            .insert_sample_rows(rows.clone())
            .await
            .map_err(|e| PartError::new(e.to_string()))?;
        let mut recording = self.recording.lock();
        for row in rows {
            recording.logged.insert(row.datapoint_id, row.changed_at);
        }
        Ok(())
    }
}
