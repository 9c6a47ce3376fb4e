//! Lap bookkeeping shared by all engines
//!
//! The book is guarded by a synchronous mutex so that status reads from other
//! tasks never wait for a lap to finish.

use std::collections::VecDeque;
use std::time::Duration;

use castle_types::now_ms;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use super::{EngineError, EngineResult};

/// Number of laps whose errors are kept
pub const ERROR_HISTORY: usize = 20;

/// Stop waits of the datastate and control engines
pub const STRICT_STOP_WAITS: [Duration; 2] = [Duration::from_secs(5), Duration::from_secs(10)];

const IDLE_POLL: Duration = Duration::from_millis(25);

/// Errors collected during one lap
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LapErrors {
    pub lap: u64,
    pub at: i64,
    pub errors: Vec<String>,
}

/// Cumulative lap durations
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LapDurations {
    pub laps: u64,
    pub total_ms: u64,
    pub last_ms: u64,
    pub max_ms: u64,
}

impl LapDurations {
    fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.laps += 1;
        self.total_ms += ms;
        self.last_ms = ms;
        self.max_ms = self.max_ms.max(ms);
    }

    pub fn average_ms(&self) -> u64 {
        if self.laps == 0 {
            0
        } else {
            self.total_ms / self.laps
        }
    }
}

/// Current state of an engine
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub running: bool,
    pub should_run: bool,
    pub lap: u64,
    pub duration: LapDurations,
    pub errors: Vec<LapErrors>,
}

/// Handle to a lap in flight
#[derive(Debug)]
pub struct LapTicket {
    pub lap: u64,
    started: Instant,
}

#[derive(Default)]
struct LapState {
    running: bool,
    should_run: bool,
    lap: u64,
    duration: LapDurations,
    errors: VecDeque<LapErrors>,
}

/// Lap counter, run flags, durations and error log of one engine
pub struct LapBook {
    key: String,
    state: Mutex<LapState>,
}

impl LapBook {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(LapState::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn should_run(&self) -> bool {
        self.state.lock().should_run
    }

    /// Set the run flag, returning its previous value
    pub fn set_should_run(&self, should_run: bool) -> bool {
        std::mem::replace(&mut self.state.lock().should_run, should_run)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn lap(&self) -> u64 {
        self.state.lock().lap
    }

    /// Mark a new lap as running
    pub fn begin(&self) -> LapTicket {
        let mut state = self.state.lock();
        state.running = true;
        state.lap += 1;
        LapTicket {
            lap: state.lap,
            started: Instant::now(),
        }
    }

    /// Mark the lap as finished and record its errors
    pub fn finish(&self, ticket: LapTicket, errors: Vec<String>) {
        let elapsed = ticket.started.elapsed();
        {
            let mut state = self.state.lock();
            state.running = false;
            state.duration.record(elapsed);
        }
        self.record_errors(ticket.lap, errors);
    }

    /// Log errors against a lap number
    pub fn record_errors(&self, lap: u64, errors: Vec<String>) {
        if errors.is_empty() {
            return;
        }
        tracing::warn!(engine = %self.key, lap, errors = ?errors, "Lap finished with errors");
        let mut state = self.state.lock();
        state.errors.push_back(LapErrors {
            lap,
            at: now_ms(),
            errors,
        });
        while state.errors.len() > ERROR_HISTORY {
            state.errors.pop_front();
        }
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.state.lock();
        EngineStatus {
            running: state.running,
            should_run: state.should_run,
            lap: state.lap,
            duration: state.duration.clone(),
            errors: state.errors.iter().cloned().collect(),
        }
    }

    /// Wait for the running lap to end, trying each wait in turn
    ///
    /// Returns whether the engine went idle.
    pub async fn wait_until_idle(&self, waits: &[Duration]) -> bool {
        for (attempt, wait) in waits.iter().enumerate() {
            let deadline = Instant::now() + *wait;
            loop {
                if !self.is_running() {
                    return true;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::time::sleep(IDLE_POLL.min(deadline - now)).await;
            }
            tracing::warn!(
                engine = %self.key,
                attempt = attempt + 1,
                waited_ms = wait.as_millis() as u64,
                "Engine still running a lap"
            );
        }
        !self.is_running()
    }

    /// Clear the run flag and wait for the engine to go idle
    pub async fn stop(&self, waits: &[Duration]) -> EngineResult<()> {
        self.set_should_run(false);
        if self.wait_until_idle(waits).await {
            tracing::info!(engine = %self.key, "Engine stopped");
            Ok(())
        } else {
            let waited_ms = waits.iter().map(|w| w.as_millis() as u64).sum();
            tracing::error!(engine = %self.key, waited_ms, "Engine did not stop");
            Err(EngineError::StopTimeout {
                engine: self.key.clone(),
                waited_ms,
            })
        }
    }
}
