//! Datastate engine
//!
//! Keeps the accumulated state of the system. Every incoming delta is merged
//! into the state, the parts derive mapped, calculated and sequenced values
//! from it, and the resulting snapshot is handed to the consumers annotated
//! with the delta that triggered it.

mod calculator;
mod mapper;
mod sequencer;

pub use calculator::CalculatorPart;
pub use mapper::{DatapointMapping, MapperPart};
pub use sequencer::SequencerPart;

use std::sync::Arc;

use async_trait::async_trait;
use castle_types::EngineContext;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::engine::{
    Consumers, ContextConsumer, Engine, EngineError, EngineKind, EngineResult, EngineStatus,
    LapBook, STRICT_STOP_WAITS,
};
use crate::parts::DatastatePart;

struct Work {
    state: EngineContext,
    parts: Vec<Box<dyn DatastatePart>>,
}

pub struct DatastateEngine {
    key: String,
    part_names: Vec<String>,
    book: LapBook,
    work: tokio::sync::Mutex<Work>,
    latest: RwLock<Arc<EngineContext>>,
    consumers: Consumers<dyn ContextConsumer>,
}

impl DatastateEngine {
    pub fn new(key: impl Into<String>, parts: Vec<Box<dyn DatastatePart>>) -> Self {
        let key = key.into();
        Self {
            part_names: parts.iter().map(|p| p.name().to_string()).collect(),
            book: LapBook::new(key.clone()),
            key,
            work: tokio::sync::Mutex::new(Work {
                state: EngineContext::new(),
                parts,
            }),
            latest: RwLock::new(Arc::new(EngineContext::new())),
            consumers: Consumers::default(),
        }
    }

    pub fn subscribe(&self, consumer: Arc<dyn ContextConsumer>) {
        self.consumers.subscribe(consumer);
    }

    /// Snapshot produced by the latest lap
    pub fn current(&self) -> Arc<EngineContext> {
        Arc::clone(&self.latest.read())
    }

    /// Merge `delta`, run the parts and notify the consumers
    pub async fn apply(&self, delta: Arc<EngineContext>) {
        let mut work = self.work.lock().await;
        let ticket = self.book.begin();
        let Work { state, parts } = &mut *work;

        state.merge_updates(&delta);
        let mut errors = Vec::new();
        for part in parts.iter_mut() {
            if let Err(e) = part.run(state) {
                errors.push(format!("{}: {e}", part.name()));
            }
        }

        let snapshot = Arc::new(state.copy_with_news(&delta));
        *self.latest.write() = Arc::clone(&snapshot);
        self.consumers.notify_context(&self.key, snapshot).await;
        self.book.finish(ticket, errors);
    }
}

#[async_trait]
impl ContextConsumer for DatastateEngine {
    async fn on_context(&self, source: &str, context: Arc<EngineContext>) {
        if !self.book.should_run() {
            debug!(engine = %self.key, source, "Ignoring context while stopped");
            return;
        }
        self.apply(context).await;
    }
}

#[async_trait]
impl Engine for DatastateEngine {
    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Datastate
    }

    async fn start(&self) -> EngineResult<()> {
        if self.book.set_should_run(true) {
            return Err(EngineError::AlreadyRunning(self.key.clone()));
        }
        info!(engine = %self.key, "Datastate started");
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        self.book.stop(&STRICT_STOP_WAITS).await
    }

    fn status(&self) -> EngineStatus {
        self.book.status()
    }

    fn settings(&self) -> serde_json::Value {
        serde_json::json!({ "parts": self.part_names })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{DatapointCalculator, ExpressionEngine};
    use castle_types::{
        ChangeCondition, Datapoint, DatapointSequence, DatapointState, SequenceLimit, ValueType,
    };
    use parking_lot::Mutex;

    struct Capture(Mutex<Vec<Arc<EngineContext>>>);

    #[async_trait]
    impl ContextConsumer for Capture {
        async fn on_context(&self, _source: &str, context: Arc<EngineContext>) {
            self.0.lock().push(context);
        }
    }

    fn number(id: &str) -> Datapoint {
        Datapoint::new(id, id, ValueType::Number)
    }

    fn delta(id: &str, at: i64, value: f64) -> Arc<EngineContext> {
        let mut ctx = EngineContext::new();
        ctx.set_datapoint(number(id), DatapointState::number(id, at, value));
        Arc::new(ctx)
    }

    fn engine() -> DatastateEngine {
        let expressions = Arc::new(ExpressionEngine::new());
        let doubled =
            DatapointCalculator::new(expressions, number("doubled"), "get(\"power\") * 2.0")
                .unwrap();
        DatastateEngine::new(
            "datastate",
            vec![
                Box::new(MapperPart::new(
                    "mapper",
                    vec![DatapointMapping {
                        source: "raw-power".into(),
                        target: number("power"),
                    }],
                )) as Box<dyn DatastatePart>,
                Box::new(CalculatorPart::new("calculator", vec![doubled])),
                Box::new(SequencerPart::new(
                    "sequencer",
                    vec![DatapointSequence {
                        id: "power-seq".into(),
                        name: "Power".into(),
                        datapoint_id: "power".into(),
                        condition: ChangeCondition::Value,
                        limit: SequenceLimit::count(2),
                    }],
                )),
            ],
        )
    }

    #[tokio::test]
    async fn test_delta_flows_through_parts() {
        let engine = engine();
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        engine.subscribe(capture.clone());
        engine.start().await.unwrap();

        engine.on_context("collector", delta("raw-power", 10, 100.0)).await;
        engine.on_context("collector", delta("raw-power", 20, 150.0)).await;
        engine.on_context("collector", delta("raw-power", 30, 200.0)).await;

        let seen = capture.0.lock().clone();
        assert_eq!(seen.len(), 3);
        let last = &seen[2];
        assert_eq!(last.get_state("power").and_then(|s| s.value_num), Some(200.0));
        assert_eq!(last.get_state("doubled").and_then(|s| s.value_num), Some(400.0));
        let seq = &last.get_sequence("power-seq").unwrap().state;
        assert_eq!(
            seq.iter().filter_map(|s| s.value_num).collect::<Vec<_>>(),
            vec![150.0, 200.0]
        );

        let news = last.news().unwrap();
        assert!(news.get_datapoint("raw-power").is_some());
        assert!(news.get_datapoint("doubled").is_none());

        // Earlier snapshots are not affected by later laps
        let first_seq = &seen[0].get_sequence("power-seq").unwrap().state;
        assert_eq!(first_seq.len(), 1);
        assert_eq!(engine.status().lap, 3);
    }

    #[tokio::test]
    async fn test_stopped_engine_ignores_context() {
        let engine = engine();
        engine.on_context("collector", delta("raw-power", 10, 1.0)).await;
        assert_eq!(engine.status().lap, 0);
        assert!(!engine.current().has_any_data());
    }
}
