//! Control engine
//!
//! A control engine runs its parts whenever a new context arrives (or an
//! action is triggered). Parts propose device targets; the engine executes
//! them at the end of the part or the lap, records the executed requests and
//! folds the lap into a bounded history.
//!
//! # Lap
//!
//! 1. Remember the incoming context
//! 2. Create an empty control context for the lap
//! 3. Run each part against the context
//! 4. After each part, execute the targets due at part end
//! 5. After all parts, execute the targets due at lap end
//! 6. Fold the lap into the history, notify history consumers on change
//! 7. Notify lap-end consumers
//! 8. Record lap duration and errors

mod actions;
mod device;
mod freezers;

pub use actions::{ActionControl, ActionWrite};
pub use device::DeviceController;
pub use freezers::{FreezersControl, FreezersSettings};

use std::sync::Arc;

use async_trait::async_trait;
use castle_types::{
    ControlContext, DEFAULT_EXECUTED_REQUESTS, DeviceControlRequest, EngineContext,
    ExecutedRequest, TargetTiming,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::{
    Consumers, ContextConsumer, ControlConsumer, Engine, EngineError, EngineKind, EngineResult,
    EngineStatus, LapBook, STRICT_STOP_WAITS,
};
use crate::parts::{ControlAction, ControlPart};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlSettings {
    /// Executed requests kept in the history
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_max_history() -> usize {
    DEFAULT_EXECUTED_REQUESTS
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_EXECUTED_REQUESTS,
        }
    }
}

/// What a control lap did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LapOutcome {
    pub lap: u64,
    /// Parts that handled the triggering action
    pub handled_by: Vec<String>,
    pub executed: Vec<ExecutedRequest>,
    pub errors: Vec<String>,
}

#[derive(Clone, Copy)]
enum Trigger<'a> {
    Context,
    Action(&'a ControlAction),
}

struct Work {
    parts: Vec<Box<dyn ControlPart>>,
    context: Arc<EngineContext>,
}

pub struct ControlEngine {
    key: String,
    settings: ControlSettings,
    part_names: Vec<String>,
    book: LapBook,
    work: tokio::sync::Mutex<Work>,
    history: RwLock<ControlContext>,
    devices: Arc<dyn DeviceController>,
    lap_consumers: Consumers<dyn ControlConsumer>,
    history_consumers: Consumers<dyn ControlConsumer>,
}

impl ControlEngine {
    pub fn new(
        key: impl Into<String>,
        settings: ControlSettings,
        parts: Vec<Box<dyn ControlPart>>,
        devices: Arc<dyn DeviceController>,
    ) -> Self {
        let key = key.into();
        Self {
            part_names: parts.iter().map(|p| p.name().to_string()).collect(),
            book: LapBook::new(key.clone()),
            history: RwLock::new(ControlContext::with_capacity(
                key.clone(),
                settings.max_history,
            )),
            key,
            settings,
            work: tokio::sync::Mutex::new(Work {
                parts,
                context: Arc::new(EngineContext::new()),
            }),
            devices,
            lap_consumers: Consumers::default(),
            history_consumers: Consumers::default(),
        }
    }

    /// Consumers of every lap's control context
    pub fn subscribe_lap_end(&self, consumer: Arc<dyn ControlConsumer>) {
        self.lap_consumers.subscribe(consumer);
    }

    /// Consumers of the history, notified when it changed
    pub fn subscribe_history(&self, consumer: Arc<dyn ControlConsumer>) {
        self.history_consumers.subscribe(consumer);
    }

    pub fn history(&self) -> ControlContext {
        self.history.read().copy()
    }

    /// Run a lap for `action` against the latest context
    pub async fn consume_action(&self, action: &ControlAction) -> EngineResult<LapOutcome> {
        if !self.book.should_run() {
            return Err(EngineError::NotRunning(self.key.clone()));
        }
        Ok(self.run_lap(None, Trigger::Action(action)).await)
    }

    async fn run_lap(&self, context: Option<Arc<EngineContext>>, trigger: Trigger<'_>) -> LapOutcome {
        let mut work = self.work.lock().await;
        if let Some(context) = context {
            work.context = context;
        }
        let ticket = self.book.begin();
        let context = Arc::clone(&work.context);
        let mut control = ControlContext::with_capacity(&self.key, self.settings.max_history);
        let mut outcome = LapOutcome {
            lap: ticket.lap,
            ..LapOutcome::default()
        };

        for part in work.parts.iter_mut() {
            let result = match trigger {
                Trigger::Context => Some(part.run(&context, &mut control).await),
                Trigger::Action(action) => part.run_for_action(action, &context, &mut control).await,
            };
            match result {
                Some(Ok(())) if matches!(trigger, Trigger::Action(_)) => {
                    outcome.handled_by.push(part.name().to_string());
                }
                Some(Err(e)) => outcome.errors.push(format!("{}: {e}", part.name())),
                _ => {}
            }
            let failed = self
                .execute_targets(&mut control, &[TargetTiming::PartEnd])
                .await;
            outcome.errors.extend(failed);
        }
        let failed = self
            .execute_targets(&mut control, &[TargetTiming::LapEnd])
            .await;
        outcome.errors.extend(failed);

        outcome.executed = control.executed_requests().cloned().collect();
        let changed = self
            .history
            .write()
            .add_content_from(&control, self.settings.max_history);
        if changed {
            let history = Arc::new(self.history.read().copy());
            self.history_consumers.notify_control(&self.key, history).await;
        }
        self.lap_consumers
            .notify_control(&self.key, Arc::new(control))
            .await;

        self.book.finish(ticket, outcome.errors.clone());
        outcome
    }

    /// Execute and drain the targets due at `whens`
    ///
    /// Returns one error per failed device request.
    async fn execute_targets(
        &self,
        control: &mut ControlContext,
        whens: &[TargetTiming],
    ) -> Vec<String> {
        let mut due: Vec<_> = control
            .reset_datapoint_targets_partial(whens)
            .into_iter()
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0));

        let mut errors = Vec::new();
        for (device_id, targets) in due {
            let mut targets: Vec<_> = targets.into_values().collect();
            targets.sort_by(|a, b| a.target.datapoint_id.cmp(&b.target.datapoint_id));
            let request = DeviceControlRequest { targets };

            let response = self
                .devices
                .execute_control_request(&device_id, &request)
                .await;
            if response.success {
                debug!(engine = %self.key, device = %device_id, targets = request.targets.len(), "Control request executed");
            } else {
                let error = response.error.as_deref().unwrap_or("control request failed");
                errors.push(format!("device {device_id}: {error}"));
            }
            control.add_executed_request(device_id, request, response);
        }
        errors
    }
}

#[async_trait]
impl ContextConsumer for ControlEngine {
    async fn on_context(&self, source: &str, context: Arc<EngineContext>) {
        if !self.book.should_run() {
            debug!(engine = %self.key, source, "Ignoring context while stopped");
            return;
        }
        self.run_lap(Some(context), Trigger::Context).await;
    }
}

#[async_trait]
impl Engine for ControlEngine {
    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Control
    }

    async fn start(&self) -> EngineResult<()> {
        if self.book.set_should_run(true) {
            return Err(EngineError::AlreadyRunning(self.key.clone()));
        }
        info!(engine = %self.key, parts = self.part_names.len(), "Control started");
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
            "maxHistory": self.settings.max_history,
            "parts": self.part_names,
        })
    }
}
