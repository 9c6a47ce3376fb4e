//! Simulated devices
//!
//! Constant, clock and file replay devices for testing installations
//! without hardware.

use std::collections::HashMap;
use std::path::PathBuf;

use castle_types::{Datapoint, DatapointState, DeviceControlResponse, DeviceStatus, now_ms};
use chrono::{Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

// ─────────────────────────────────────────────────────────────────────────────
// sim-constant
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstantSettings {
    #[serde(default)]
    pub value: f64,
}

/// Reports `value` until a control request changes it
pub struct ConstantDevice {
    value: Mutex<f64>,
}

impl ConstantDevice {
    pub fn new(settings: ConstantSettings) -> Self {
        Self {
            value: Mutex::new(settings.value),
        }
    }

    pub async fn fetch(&self) -> DeviceStatus {
        let value = *self.value.lock();
        DeviceStatus::responsive(HashMap::from([(
            "value".to_string(),
            DatapointState::number("value", now_ms(), value),
        )]))
    }

    pub async fn execute(&self, targets: &[(Datapoint, DatapointState)]) -> DeviceControlResponse {
        for (dp, state) in targets {
            match (dp.id.as_str(), state.value_num) {
                ("value", Some(value)) => *self.value.lock() = value,
                ("value", None) => return DeviceControlResponse::failed("value must be a number"),
                (other, _) => {
                    return DeviceControlResponse::failed(format!("unknown datapoint {other}"));
                }
            }
        }
        DeviceControlResponse::ok()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// sim-seconds
// ─────────────────────────────────────────────────────────────────────────────

/// Reports the second of the current minute
pub struct SecondsDevice;

impl SecondsDevice {
    pub async fn fetch(&self) -> DeviceStatus {
        let now = Utc::now();
        DeviceStatus::responsive(HashMap::from([(
            "seconds".to_string(),
            DatapointState::number("seconds", now.timestamp_millis(), now.second() as f64),
        )]))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// sim-file
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    #[default]
    Step,
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSettings {
    #[serde(default)]
    pub interpolation: Interpolation,
    /// Start over after the last sample
    #[serde(default = "default_repeat", rename = "loop")]
    pub repeat: bool,
}

fn default_repeat() -> bool {
    true
}

/// One sample of a recorded series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Milliseconds since the start of the recording
    pub offset: i64,
    pub value: f64,
}

/// Value of a series (sorted by offset) at `offset`
///
/// Before the first sample the first value applies, after the last sample
/// the last value.
pub fn sample_series(series: &[SeriesPoint], offset: i64, interpolation: Interpolation) -> Option<f64> {
    let first = series.first()?;
    if offset <= first.offset {
        return Some(first.value);
    }
    let index = series.partition_point(|p| p.offset <= offset) - 1;
    let current = series[index];
    let Some(next) = series.get(index + 1) else {
        return Some(current.value);
    };
    match interpolation {
        Interpolation::Step => Some(current.value),
        Interpolation::Linear => {
            let span = (next.offset - current.offset) as f64;
            let ratio = (offset - current.offset) as f64 / span;
            Some(current.value + (next.value - current.value) * ratio)
        }
    }
}

/// Replays the series stored in the JSON file `api`
pub struct FileDevice {
    path: PathBuf,
    settings: FileSettings,
    started_at: i64,
    series: OnceCell<Vec<SeriesPoint>>,
}

impl FileDevice {
    pub fn new(path: impl Into<PathBuf>, settings: FileSettings) -> Self {
        Self {
            path: path.into(),
            settings,
            started_at: now_ms(),
            series: OnceCell::new(),
        }
    }

    async fn load(&self) -> Result<&[SeriesPoint], String> {
        let series = self
            .series
            .get_or_try_init(|| async {
                let raw = tokio::fs::read(&self.path)
                    .await
                    .map_err(|e| format!("{}: {e}", self.path.display()))?;
                let mut series: Vec<SeriesPoint> = serde_json::from_slice(&raw)
                    .map_err(|e| format!("{}: {e}", self.path.display()))?;
                series.sort_by_key(|p| p.offset);
                Ok::<_, String>(series)
            })
            .await?;
        Ok(series.as_slice())
    }

    /// Offset into the series at `now`
    fn offset_at(&self, series: &[SeriesPoint], now: i64) -> i64 {
        let elapsed = now - self.started_at;
        let period = series.last().map(|p| p.offset).unwrap_or(0);
        if self.settings.repeat && period > 0 {
            elapsed.rem_euclid(period)
        } else {
            elapsed
        }
    }

    pub async fn fetch(&self) -> DeviceStatus {
        let series = match self.load().await {
            Ok(series) => series,
            Err(e) => return DeviceStatus::unresponsive(e),
        };
        let now = now_ms();
        let offset = self.offset_at(series, now);
        match sample_series(series, offset, self.settings.interpolation) {
            Some(value) => DeviceStatus::responsive(HashMap::from([(
                "value".to_string(),
                DatapointState::number("value", now, value),
            )])),
            None => DeviceStatus::unresponsive(format!("{} is empty", self.path.display())),
        }
    }
}
