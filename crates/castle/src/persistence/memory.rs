//! In-memory persistence
//!
//! Keeps the newest `max_rows` rows of each log. Contents are lost on
//! disconnect.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ControlLogRow, DatapointLogRow, Persistence, PersistenceError, PersistenceResult, Sample,
    SampleDataRow, TimeRange,
};

#[derive(Default)]
struct Logs {
    connected: bool,
    datapoints: VecDeque<DatapointLogRow>,
    controls: VecDeque<ControlLogRow>,
    samples: BTreeMap<String, Sample>,
    sample_rows: VecDeque<SampleDataRow>,
}

pub struct MemoryPersistence {
    name: String,
    max_rows: usize,
    logs: Mutex<Logs>,
}

fn push_bounded<T>(log: &mut VecDeque<T>, rows: Vec<T>, max_rows: usize) {
    log.extend(rows);
    while log.len() > max_rows {
        log.pop_front();
    }
}

impl MemoryPersistence {
    pub fn new(name: impl Into<String>, max_rows: usize) -> Self {
        Self {
            name: name.into(),
            max_rows,
            logs: Mutex::new(Logs::default()),
        }
    }

    fn with_logs<T>(&self, f: impl FnOnce(&mut Logs) -> T) -> PersistenceResult<T> {
        let mut logs = self.logs.lock();
        if !logs.connected {
            return Err(PersistenceError::NotConnected(self.name.clone()));
        }
        Ok(f(&mut logs))
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> PersistenceResult<()> {
        self.logs.lock().connected = true;
        Ok(())
    }

    async fn insert_datapoint_rows(&self, rows: Vec<DatapointLogRow>) -> PersistenceResult<()> {
        let max_rows = self.max_rows;
        self.with_logs(|logs| push_bounded(&mut logs.datapoints, rows, max_rows))
    }

    async fn select_datapoint_rows(
        &self,
        range: TimeRange,
    ) -> PersistenceResult<Vec<DatapointLogRow>> {
        self.with_logs(|logs| {
            let mut rows: Vec<DatapointLogRow> = logs
                .datapoints
                .iter()
                .filter(|r| range.contains(r.changed_at))
                .cloned()
                .collect();
            rows.sort_by_key(|r| r.changed_at);
            rows
        })
    }

    async fn insert_control_rows(&self, rows: Vec<ControlLogRow>) -> PersistenceResult<()> {
        let max_rows = self.max_rows;
        self.with_logs(|logs| push_bounded(&mut logs.controls, rows, max_rows))
    }

    async fn select_control_rows(&self, range: TimeRange) -> PersistenceResult<Vec<ControlLogRow>> {
        self.with_logs(|logs| {
            let mut rows: Vec<ControlLogRow> = logs
                .controls
                .iter()
                .filter(|r| range.contains(r.logged_at))
                .cloned()
                .collect();
            rows.sort_by_key(|r| r.logged_at);
            rows
        })
    }

    async fn upsert_sample(&self, sample: Sample) -> PersistenceResult<()> {
        self.with_logs(|logs| {
            logs.samples.insert(sample.sample_id.clone(), sample);
        })
    }

    async fn select_samples(&self) -> PersistenceResult<Vec<Sample>> {
        self.with_logs(|logs| logs.samples.values().cloned().collect())
    }

    async fn insert_sample_rows(&self, rows: Vec<SampleDataRow>) -> PersistenceResult<()> {
        let max_rows = self.max_rows;
        self.with_logs(|logs| push_bounded(&mut logs.sample_rows, rows, max_rows))
    }

    async fn select_sample_rows(
        &self,
        sample_id: &str,
        range: TimeRange,
    ) -> PersistenceResult<Vec<SampleDataRow>> {
        self.with_logs(|logs| {
            let mut rows: Vec<SampleDataRow> = logs
                .sample_rows
                .iter()
                .filter(|r| r.sample_id == sample_id && range.contains(r.changed_at))
                .cloned()
                .collect();
            rows.sort_by_key(|r| r.changed_at);
            rows
        })
    }

    async fn disconnect(&self) -> PersistenceResult<()> {
        *self.logs.lock() = Logs::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, at: i64) -> DatapointLogRow {
        DatapointLogRow {
            datapoint_id: id.to_string(),
            value_num: Some(at as f64),
            value_string: None,
            changed_at: at,
        }
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let memory = MemoryPersistence::new("mem", 10);
        let result = memory.insert_datapoint_rows(vec![row("a", 1)]).await;
        assert!(matches!(result, Err(PersistenceError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_bounded_and_ranged() {
        let memory = MemoryPersistence::new("mem", 3);
        memory.connect().await.unwrap();
        memory
            .insert_datapoint_rows((1..=5).map(|at| row("a", at)).collect())
            .await
            .unwrap();

        let all = memory
            .select_datapoint_rows(TimeRange::new(0, 100))
            .await
            .unwrap();
        let ats: Vec<i64> = all.iter().map(|r| r.changed_at).collect();
        assert_eq!(ats, vec![3, 4, 5]);

        let some = memory
            .select_datapoint_rows(TimeRange::new(3, 5))
            .await
            .unwrap();
        assert_eq!(some.len(), 2);

        memory.disconnect().await.unwrap();
        assert!(memory.select_control_rows(TimeRange::new(0, 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_sample_rows_are_kept_per_sample() {
        let memory = MemoryPersistence::new("mem", 10);
        memory.connect().await.unwrap();
        for id in ["winter", "summer"] {
            memory
                .upsert_sample(Sample {
                    sample_id: id.to_string(),
                    name: id.to_string(),
                    description: None,
                    length_ms: None,
                    datapoints: Vec::new(),
                })
                .await
                .unwrap();
        }
        let state = castle_types::DatapointState::number("t", 5, 1.0);
        memory
            .insert_sample_rows(vec![
                SampleDataRow::new("winter", "t", &state),
                SampleDataRow::new("summer", "t", &state),
            ])
            .await
            .unwrap();

        let ids: Vec<String> = memory
            .select_samples()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.sample_id)
            .collect();
        assert_eq!(ids, vec!["summer", "winter"]);
        let rows = memory
            .select_sample_rows("winter", TimeRange::new(0, 10))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sample_id, "winter");
    }
}
