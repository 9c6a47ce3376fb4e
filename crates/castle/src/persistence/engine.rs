//! Persistence engine
//!
//! Wraps a backend as an engine so it joins the system lifecycle: starting
//! connects the backend, stopping disconnects it. It runs no laps.

use std::sync::Arc;

use async_trait::async_trait;
use castle_runtime::engine::LapBook;
use castle_runtime::{Engine, EngineError, EngineKind, EngineResult, EngineStatus};
use tracing::{error, info, warn};

use super::{
    ControlLogPart, DatapointLogPart, Persistence, Sample, SampleLogPart, SampleMember,
};
use crate::config::SampleLogConfig;

pub struct PersistenceEngine {
    key: String,
    backend: Arc<dyn Persistence>,
    book: LapBook,
}

impl PersistenceEngine {
    pub fn new(key: impl Into<String>, backend: Arc<dyn Persistence>) -> Self {
        let key = key.into();
        Self {
            book: LapBook::new(key.clone()),
            key,
            backend,
        }
    }

    pub fn backend(&self) -> Arc<dyn Persistence> {
        Arc::clone(&self.backend)
    }

    pub fn make_datapoint_log_part(&self, ids: &[String]) -> DatapointLogPart {
        DatapointLogPart::new(format!("{}:datapoint-log", self.key), self.backend(), ids)
    }

    pub fn make_control_log_part(&self) -> ControlLogPart {
        ControlLogPart::new(format!("{}:control-log", self.key), self.backend())
    }

    pub fn make_sample_log_part(&self, config: &SampleLogConfig) -> SampleLogPart {
        let sample = Sample {
            sample_id: config.sample_id.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            length_ms: config.length_ms,
            datapoints: Vec::new(),
        };
        let members = config
            .datapoints
            .iter()
            .map(|datapoint| SampleMember {
                datapoint_id: datapoint.id.clone(),
                description: datapoint.description.clone(),
                meaning: datapoint.meaning.clone(),
            })
            .collect();
        SampleLogPart::new(format!("{}:sample-log", self.key), self.backend(), sample, members)
    }
}

#[async_trait]
impl Engine for PersistenceEngine {
    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Persistence
    }

    async fn start(&self) -> EngineResult<()> {
        if self.book.set_should_run(true) {
            return Err(EngineError::AlreadyRunning(self.key.clone()));
        }
        if let Err(e) = self.backend.connect().await {
            self.book.set_should_run(false);
            error!(engine = %self.key, error = %e, "Failed to connect persistence");
            return Err(EngineError::Internal(format!("{}: {e}", self.key)));
        }
        info!(engine = %self.key, backend = self.backend.kind(), "Persistence connected");
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        if !self.book.set_should_run(false) {
            return Ok(());
        }
        if let Err(e) = self.backend.disconnect().await {
            warn!(engine = %self.key, error = %e, "Failed to disconnect persistence");
            return Err(EngineError::Internal(format!("{}: {e}", self.key)));
        }
        info!(engine = %self.key, "Persistence disconnected");
        Ok(())
    }

    fn status(&self) -> EngineStatus {
        self.book.status()
    }

    fn settings(&self) -> serde_json::Value {
        serde_json::json!({ "type": self.backend.kind() })
    }
}
