//! Datacollector engine
//!
//! Runs its parts on a fixed cadence and hands each lap's collected updates
//! to the subscribed consumers. Parts that push unsolicited updates trigger
//! abbreviated laps that skip fetching.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use castle_types::EngineContext;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::engine::{
    Consumers, ContextConsumer, Engine, EngineError, EngineKind, EngineResult, EngineStatus,
    LapBook,
};
use crate::parts::DatacollectorPart;

/// Pause enforced between two laps even when a lap overran
pub const MIN_LAP_PAUSE: Duration = Duration::from_millis(1000);

const MAX_FIRST_STOP_WAIT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatacollectorSettings {
    /// Lap cadence in milliseconds; negative disables interval laps
    pub lap_duration: i64,
}

impl Default for DatacollectorSettings {
    fn default() -> Self {
        Self { lap_duration: 5000 }
    }
}

impl DatacollectorSettings {
    /// Interval between lap starts, if interval laps are enabled
    pub fn interval(&self) -> Option<Duration> {
        u64::try_from(self.lap_duration)
            .ok()
            .map(Duration::from_millis)
    }

    /// Waits used by `stop`: `min(lap, 5s)` first, then a full lap
    pub fn stop_waits(&self) -> [Duration; 2] {
        match self.interval().filter(|lap| !lap.is_zero()) {
            Some(lap) => [lap.min(MAX_FIRST_STOP_WAIT), lap],
            None => crate::engine::STRICT_STOP_WAITS,
        }
    }
}

/// Delay before the next lap starts
pub fn next_lap_delay(lap_duration: Duration, elapsed: Duration) -> Duration {
    lap_duration.saturating_sub(elapsed).max(MIN_LAP_PAUSE)
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

struct Inner {
    key: String,
    settings: DatacollectorSettings,
    parts: Vec<Arc<dyn DatacollectorPart>>,
    book: LapBook,
    /// Serializes interval and push laps
    lap_lock: tokio::sync::Mutex<()>,
    /// Latest collected state of every datapoint
    collected: RwLock<EngineContext>,
    consumers: Consumers<dyn ContextConsumer>,
    push_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineContext>>>,
    interval_task: Mutex<Option<JoinHandle<()>>>,
    wake: Notify,
}

pub struct DatacollectorEngine {
    inner: Arc<Inner>,
}

impl DatacollectorEngine {
    pub fn new(
        key: impl Into<String>,
        settings: DatacollectorSettings,
        parts: Vec<Arc<dyn DatacollectorPart>>,
    ) -> Self {
        let key = key.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pushing = false;
        for part in &parts {
            pushing |= part.register_push(tx.clone());
        }
        drop(tx);

        Self {
            inner: Arc::new(Inner {
                book: LapBook::new(key.clone()),
                key,
                settings,
                parts,
                lap_lock: tokio::sync::Mutex::new(()),
                collected: RwLock::new(EngineContext::new()),
                consumers: Consumers::default(),
                push_rx: Mutex::new(pushing.then_some(rx)),
                interval_task: Mutex::new(None),
                wake: Notify::new(),
            }),
        }
    }

    pub fn subscribe(&self, consumer: Arc<dyn ContextConsumer>) {
        self.inner.consumers.subscribe(consumer);
    }

    /// Snapshot of everything collected so far
    pub fn collected(&self) -> EngineContext {
        self.inner.collected.read().copy()
    }

    /// Run one full lap right away
    pub async fn run_lap(&self) {
        self.inner.run_lap().await;
    }
}

impl Inner {
    async fn run_lap(&self) {
        let _lap = self.lap_lock.lock().await;
        let ticket = self.book.begin();
        self.consumers.notify_lap_start(&self.key, ticket.lap).await;

        let results = join_all(self.parts.iter().map(|part| async move {
            let mut updates = EngineContext::new();
            let result = part.run(&mut updates).await;
            (part.name(), updates, result)
        }))
        .await;

        let mut lap_updates = EngineContext::new();
        let mut errors = Vec::new();
        for (name, updates, result) in results {
            lap_updates.merge_updates(&updates);
            if let Err(e) = result {
                errors.push(format!("{name}: {e}"));
            }
        }

        self.collected.write().merge_updates(&lap_updates);
        self.consumers
            .notify_context(&self.key, Arc::new(lap_updates))
            .await;
        self.book.finish(ticket, errors);
    }

    /// Lap driven by a pushed update; nothing is fetched
    async fn run_push_lap(&self, updates: EngineContext) {
        let _lap = self.lap_lock.lock().await;
        let ticket = self.book.begin();
        self.consumers.notify_lap_start(&self.key, ticket.lap).await;
        self.collected.write().merge_updates(&updates);
        self.consumers
            .notify_context(&self.key, Arc::new(updates))
            .await;
        self.book.finish(ticket, Vec::new());
    }
}

async fn interval_loop(inner: Arc<Inner>, lap_duration: Duration) {
    while inner.book.should_run() {
        let started = Instant::now();
        inner.run_lap().await;
        if !inner.book.should_run() {
            break;
        }
        let delay = next_lap_delay(lap_duration, started.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.wake.notified() => {}
        }
    }
    debug!(engine = %inner.key, "Interval laps ended");
}

async fn push_loop(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<EngineContext>) {
    while let Some(updates) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.book.should_run() {
            debug!(engine = %inner.key, "Dropping pushed update while stopped");
            continue;
        }
        inner.run_push_lap(updates).await;
    }
}

#[async_trait]
impl Engine for DatacollectorEngine {
    fn key(&self) -> &str {
        &self.inner.key
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Datacollector
    }

    async fn start(&self) -> EngineResult<()> {
        if self.inner.book.set_should_run(true) {
            return Err(EngineError::AlreadyRunning(self.inner.key.clone()));
        }

        if let Some(rx) = self.inner.push_rx.lock().take() {
            tokio::spawn(push_loop(Arc::downgrade(&self.inner), rx));
        }

        if let Some(lap_duration) = self.inner.settings.interval() {
            let handle = tokio::spawn(interval_loop(Arc::clone(&self.inner), lap_duration));
            // A loop left over from the previous run is idle by now
            if let Some(stale) = self.inner.interval_task.lock().replace(handle) {
                stale.abort();
            }
        }

        info!(
            engine = %self.inner.key,
            lap_duration = self.inner.settings.lap_duration,
            parts = self.inner.parts.len(),
            "Datacollector started"
        );
        Ok(())
    }

    async fn stop(&self) -> EngineResult<()> {
        self.inner.book.set_should_run(false);
        self.inner.wake.notify_waiters();
        self.inner.book.stop(&self.inner.settings.stop_waits()).await
    }

    fn status(&self) -> EngineStatus {
        self.inner.book.status()
    }

    fn settings(&self) -> serde_json::Value {
        serde_json::json!({
            "lapDuration": self.inner.settings.lap_duration,
            "parts": self.inner.parts.iter().map(|p| p.name()).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parts::{PartResult, PushSink};
    use castle_types::{Datapoint, DatapointState, ValueType};

    struct SlowPart {
        work: Duration,
        starts: Arc<Mutex<Vec<Instant>>>,
        ends: Arc<Mutex<Vec<Instant>>>,
    }

    #[async_trait]
    impl DatacollectorPart for SlowPart {
        fn name(&self) -> &str {
            "slow"
        }

        async fn run(&self, updates: &mut EngineContext) -> PartResult {
            self.starts.lock().push(Instant::now());
            tokio::time::sleep(self.work).await;
            updates.set_datapoint(
                Datapoint::new("p", "P", ValueType::Number),
                DatapointState::number("p", 1, 1.0),
            );
            self.ends.lock().push(Instant::now());
            Ok(())
        }
    }

    type Marks = Arc<Mutex<Vec<Instant>>>;

    fn slow_engine(work_ms: u64, lap_ms: i64) -> (DatacollectorEngine, Marks, Marks) {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let ends = Arc::new(Mutex::new(Vec::new()));
        let part = SlowPart {
            work: Duration::from_millis(work_ms),
            starts: Arc::clone(&starts),
            ends: Arc::clone(&ends),
        };
        let engine = DatacollectorEngine::new(
            "collector",
            DatacollectorSettings {
                lap_duration: lap_ms,
            },
            vec![Arc::new(part) as Arc<dyn DatacollectorPart>],
        );
        (engine, starts, ends)
    }

    #[test]
    fn test_next_lap_delay() {
        let lap = Duration::from_millis(2000);
        assert_eq!(
            next_lap_delay(lap, Duration::from_millis(500)),
            Duration::from_millis(1500)
        );
        assert_eq!(next_lap_delay(lap, Duration::from_millis(2500)), MIN_LAP_PAUSE);
        assert_eq!(next_lap_delay(lap, Duration::from_millis(1900)), MIN_LAP_PAUSE);
    }

    #[test]
    fn test_stop_waits() {
        let short = DatacollectorSettings { lap_duration: 2000 };
        assert_eq!(
            short.stop_waits(),
            [Duration::from_millis(2000), Duration::from_millis(2000)]
        );
        let long = DatacollectorSettings {
            lap_duration: 30_000,
        };
        assert_eq!(
            long.stop_waits(),
            [Duration::from_millis(5000), Duration::from_millis(30_000)]
        );
        assert!(DatacollectorSettings { lap_duration: -1 }.interval().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_lap_still_pauses() {
        let (engine, starts, ends) = slow_engine(2500, 2000);
        engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(6000)).await;
        engine.stop().await.unwrap();

        let starts = starts.lock().clone();
        let ends = ends.lock().clone();
        assert!(starts.len() >= 2);
        assert!(starts[1] - ends[0] >= MIN_LAP_PAUSE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_lap_keeps_cadence() {
        let (engine, starts, _) = slow_engine(500, 2000);
        engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(4500)).await;
        engine.stop().await.unwrap();

        let starts = starts.lock().clone();
        assert!(starts.len() >= 2);
        let gap = starts[1] - starts[0];
        assert!(gap >= Duration::from_millis(2000));
        assert!(gap < Duration::from_millis(2100));
        assert!(!engine.status().running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_is_rejected() {
        let (engine, _, _) = slow_engine(10, 1000);
        engine.start().await.unwrap();
        assert!(matches!(
            engine.start().await,
            Err(EngineError::AlreadyRunning(_))
        ));
        engine.stop().await.unwrap();
    }

    struct Pusher {
        sink: Mutex<Option<PushSink>>,
    }

    #[async_trait]
    impl DatacollectorPart for Pusher {
        fn name(&self) -> &str {
            "pusher"
        }

        async fn run(&self, _updates: &mut EngineContext) -> PartResult {
            Ok(())
        }

        fn register_push(&self, sink: PushSink) -> bool {
            *self.sink.lock() = Some(sink);
            true
        }
    }

    struct Counter(Arc<Mutex<Vec<usize>>>);

    #[async_trait]
    impl ContextConsumer for Counter {
        async fn on_context(&self, _source: &str, context: Arc<EngineContext>) {
            self.0.lock().push(context.datapoints().count());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushed_update_runs_lap() {
        let pusher = Arc::new(Pusher {
            sink: Mutex::new(None),
        });
        let engine = DatacollectorEngine::new(
            "collector",
            DatacollectorSettings { lap_duration: -1 },
            vec![pusher.clone() as Arc<dyn DatacollectorPart>],
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        engine.subscribe(Arc::new(Counter(Arc::clone(&seen))));
        engine.start().await.unwrap();

        let mut update = EngineContext::new();
        update.set_datapoint(
            Datapoint::new("p", "P", ValueType::Number),
            DatapointState::number("p", 5, 3.0),
        );
        let sink = pusher.sink.lock().clone().unwrap();
        sink.send(update).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(engine.status().lap, 1);
        assert_eq!(
            engine.collected().get_state("p").and_then(|s| s.value_num),
            Some(3.0)
        );
        engine.stop().await.unwrap();
    }
}
