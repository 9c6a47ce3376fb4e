//! Engine context - snapshot of datapoint and sequence states
//!
//! Contexts are handed from engine to engine. Entries are reference counted,
//! so copying a context is cheap and copies share the entries while their
//! top-level maps stay independent.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::{Datapoint, DatapointSequence, DatapointState, SequenceState, now_ms};

/// A datapoint together with its current state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextDatapoint {
    pub datapoint: Datapoint,
    pub state: DatapointState,
}

/// A sequence together with its recorded states
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextSequence {
    pub sequence: DatapointSequence,
    pub state: SequenceState,
}

/// Mapping of datapoint and sequence ids to their current entries
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineContext {
    datapoints: HashMap<String, Arc<ContextDatapoint>>,
    sequences: HashMap<String, Arc<ContextSequence>>,
    /// The delta that produced this snapshot (one level only)
    #[serde(skip_serializing_if = "Option::is_none")]
    news: Option<Arc<EngineContext>>,
    created_at: i64,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineContext {
    pub fn new() -> Self {
        Self {
            datapoints: HashMap::new(),
            sequences: HashMap::new(),
            news: None,
            created_at: now_ms(),
        }
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    // ── datapoints ──────────────────────────────────────────────────────────

    /// Set the current state of a datapoint, replacing any previous entry
    pub fn set_datapoint(&mut self, datapoint: Datapoint, state: DatapointState) {
        self.datapoints.insert(
            datapoint.id.clone(),
            Arc::new(ContextDatapoint { datapoint, state }),
        );
    }

    pub fn get_datapoint(&self, id: &str) -> Option<&ContextDatapoint> {
        self.datapoints.get(id).map(Arc::as_ref)
    }

    pub fn get_state(&self, id: &str) -> Option<&DatapointState> {
        self.get_datapoint(id).map(|entry| &entry.state)
    }

    pub fn datapoints(&self) -> impl Iterator<Item = &ContextDatapoint> {
        self.datapoints.values().map(Arc::as_ref)
    }

    pub fn datapoint_ids(&self) -> impl Iterator<Item = &str> {
        self.datapoints.keys().map(String::as_str)
    }

    /// Drain all datapoints, leaving the context without any
    pub fn reset_datapoints(&mut self) -> HashMap<String, Arc<ContextDatapoint>> {
        std::mem::take(&mut self.datapoints)
    }

    // ── sequences ───────────────────────────────────────────────────────────

    pub fn set_sequence(&mut self, sequence: DatapointSequence, state: SequenceState) {
        self.sequences.insert(
            sequence.id.clone(),
            Arc::new(ContextSequence { sequence, state }),
        );
    }

    pub fn get_sequence(&self, id: &str) -> Option<&ContextSequence> {
        self.sequences.get(id).map(Arc::as_ref)
    }

    /// Mutable access to a sequence entry; unshares it from other copies
    pub fn get_sequence_mut(&mut self, id: &str) -> Option<&mut ContextSequence> {
        self.sequences.get_mut(id).map(Arc::make_mut)
    }

    pub fn sequences(&self) -> impl Iterator<Item = &ContextSequence> {
        self.sequences.values().map(Arc::as_ref)
    }

    pub fn reset_sequences(&mut self) -> HashMap<String, Arc<ContextSequence>> {
        std::mem::take(&mut self.sequences)
    }

    // ── snapshots ───────────────────────────────────────────────────────────

    /// Apply all entries of `delta` on top of this context
    ///
    /// Last write wins per id; nothing is ever removed by a merge.
    pub fn merge_updates(&mut self, delta: &EngineContext) {
        for (id, entry) in &delta.datapoints {
            self.datapoints.insert(id.clone(), Arc::clone(entry));
        }
        for (id, entry) in &delta.sequences {
            self.sequences.insert(id.clone(), Arc::clone(entry));
        }
    }

    /// Shallow snapshot sharing all entries
    pub fn copy(&self) -> Self {
        Self {
            created_at: now_ms(),
            ..self.clone()
        }
    }

    /// Snapshot annotated with the delta that triggered it
    ///
    /// The attached delta never carries news itself.
    pub fn copy_with_news(&self, delta: &EngineContext) -> Self {
        let mut news = delta.clone();
        news.news = None;
        Self {
            news: Some(Arc::new(news)),
            ..self.copy()
        }
    }

    pub fn news(&self) -> Option<&EngineContext> {
        self.news.as_deref()
    }

    pub fn has_any_data(&self) -> bool {
        !self.datapoints.is_empty() || !self.sequences.is_empty()
    }
}
