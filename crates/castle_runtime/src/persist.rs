//! Persist engine
//!
//! Hands engine and control contexts to persist parts. It has no lap of its
//! own: every received context is one lap.

use std::sync::Arc;

use async_trait::async_trait;
use castle_types::{ControlContext, EngineContext};
use futures::future::join_all;
use tracing::{debug, info};

use crate::engine::{
    ContextConsumer, ControlConsumer, Engine, EngineError, EngineKind, EngineResult,
    EngineStatus, LapBook, STRICT_STOP_WAITS,
};
use crate::parts::{ContextPersistPart, ControlPersistPart};

pub struct PersistEngine {
    key: String,
    book: LapBook,
    lap_lock: tokio::sync::Mutex<()>,
    context_parts: Vec<Arc<dyn ContextPersistPart>>,
    control_parts: Vec<Arc<dyn ControlPersistPart>>,
}

impl PersistEngine {
    pub fn new(
        key: impl Into<String>,
        context_parts: Vec<Arc<dyn ContextPersistPart>>,
        control_parts: Vec<Arc<dyn ControlPersistPart>>,
    ) -> Self {
        let key = key.into();
        Self {
            book: LapBook::new(key.clone()),
            key,
            lap_lock: tokio::sync::Mutex::new(()),
            context_parts,
            control_parts,
        }
    }

    pub async fn persist_context(&self, context: &EngineContext) {
        if self.context_parts.is_empty() {
            return;
        }
        let _lap = self.lap_lock.lock().await;
        let ticket = self.book.begin();
        let results = join_all(self.context_parts.iter().map(|part| async move {
            (part.name(), part.run(context).await)
        }))
        .await;
        self.book.finish(ticket, collect_errors(results));
    }

    pub async fn persist_control(&self, control: &ControlContext) {
        if self.control_parts.is_empty() {
            return;
        }
        let _lap = self.lap_lock.lock().await;
        let ticket = self.book.begin();
        let results = join_all(self.control_parts.iter().map(|part| async move {
            (part.name(), part.run(control).await)
        }))
        .await;
        self.book.finish(ticket, collect_errors(results));
    }
}

fn collect_errors(results: Vec<(&str, crate::parts::PartResult)>) -> Vec<String> {
    results
        .into_iter()
        .filter_map(|(name, result)| result.err().map(|e| format!("{name}: {e}")))
        .collect()
}

#[async_trait]
impl ContextConsumer for PersistEngine {
    async fn on_context(&self, source: &str, context: Arc<EngineContext>) {
        if !self.book.should_run() {
            debug!(engine = %self.key, source, "Ignoring context while stopped");
            return;
        }
        self.persist_context(&context).await;
    }
}

#[async_trait]
impl ControlConsumer for PersistEngine {
    async fn on_control(&self, source: &str, control: Arc<ControlContext>) {
        if !self.book.should_run() {
            debug!(engine = %self.key, source, "Ignoring control context while stopped");
            return;
        }
        self.persist_control(&control).await;
    }
}

#[async_trait]
impl Engine for PersistEngine {
    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Persist
    }

    async fn start(&self) -> EngineResult<()> {
        if self.book.set_should_run(true) {
            return Err(EngineError::AlreadyRunning(self.key.clone()));
        }
        info!(
            engine = %self.key,
            context_parts = self.context_parts.len(),
            control_parts = self.control_parts.len(),
            "Persist started"
        );
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        self.book.stop(&STRICT_STOP_WAITS).await
    }

    fn status(&self) -> EngineStatus {
        self.book.status()
    }

    fn settings(&self) -> serde_json::Value {
        serde_json::json!({
            "contextParts": self.context_parts.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "controlParts": self.control_parts.iter().map(|p| p.name()).collect::<Vec<_>>(),
        })
    }
}
