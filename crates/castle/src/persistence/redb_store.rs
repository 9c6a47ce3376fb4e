//! redb persistence
//!
//! All logs live in one redb file, rows stored as JSON. Log rows are keyed
//! `<at, 20 digits>:<id>:<sequence>`, so a time range is a key range. Sample
//! rows carry the sample id in front of that key; samples are keyed by id.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use super::{
    ControlLogRow, DatapointLogRow, Persistence, PersistenceError, PersistenceResult, Sample,
    SampleDataRow, TimeRange,
};

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

const DATAPOINT_LOG: Table = TableDefinition::new("datapoint_log");
const CONTROL_LOG: Table = TableDefinition::new("datapoint_control_log");
const SAMPLES: Table = TableDefinition::new("sample");
const SAMPLE_DATA_LOG: Table = TableDefinition::new("sample_data_log");

fn storage(e: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::Storage(e.to_string())
}

fn time_key(at: i64) -> String {
    format!("{:020}", at.max(0))
}

fn encode<T: Serialize>(row: &T) -> PersistenceResult<Vec<u8>> {
    serde_json::to_vec(row).map_err(|e| PersistenceError::Serialization(e.to_string()))
}

pub struct RedbPersistence {
    name: String,
    path: PathBuf,
    db: Mutex<Option<Arc<Database>>>,
    sequence: AtomicU64,
}

impl RedbPersistence {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            db: Mutex::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    fn db(&self) -> PersistenceResult<Arc<Database>> {
        self.db
            .lock()
            .clone()
            .ok_or_else(|| PersistenceError::NotConnected(self.name.clone()))
    }

    /// Key of a log row, unique per process
    fn row_key(&self, at: i64, id: &str) -> String {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}:{id}:{n}", time_key(at))
    }

    async fn insert<T: Serialize>(
        &self,
        table: Table,
        rows: Vec<(i64, String, T)>,
    ) -> PersistenceResult<()> {
        let mut entries = Vec::with_capacity(rows.len());
        for (at, id, row) in rows {
            entries.push((self.row_key(at, &id), encode(&row)?));
        }
        self.write(table, entries).await
    }

    async fn write(&self, table: Table, entries: Vec<(String, Vec<u8>)>) -> PersistenceResult<()> {
        let db = self.db()?;
        tokio::task::spawn_blocking(move || {
            let write_txn = db.begin_write().map_err(storage)?;
            {
                let mut table = write_txn.open_table(table).map_err(storage)?;
                for (key, value) in &entries {
                    table
                        .insert(key.as_str(), value.as_slice())
                        .map_err(storage)?;
                }
            }
            write_txn.commit().map_err(storage)
        })
        .await
        .map_err(storage)?
    }

    async fn select<T: DeserializeOwned + Send + 'static>(
        &self,
        table: Table,
        range: TimeRange,
    ) -> PersistenceResult<Vec<T>> {
        self.select_keys(table, Some((time_key(range.from), time_key(range.to))))
            .await
    }

    /// Rows with keys in `[start, end)`, or all rows
    async fn select_keys<T: DeserializeOwned + Send + 'static>(
        &self,
        table: Table,
        keys: Option<(String, String)>,
    ) -> PersistenceResult<Vec<T>> {
        let db = self.db()?;
        tokio::task::spawn_blocking(move || {
            let read_txn = db.begin_read().map_err(storage)?;
            let table = read_txn.open_table(table).map_err(storage)?;
            let entries = match &keys {
                Some((start, end)) => table.range(start.as_str()..end.as_str()),
                None => table.iter(),
            }
            .map_err(storage)?;

            let mut rows = Vec::new();
            for entry in entries {
                let (_, value) = entry.map_err(storage)?;
                let row: T = serde_json::from_slice(value.value())
                    .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
                rows.push(row);
            }
            Ok::<_, PersistenceError>(rows)
        })
        .await
        .map_err(storage)?
    }
}

#[async_trait]
impl Persistence for RedbPersistence {
    fn kind(&self) -> &'static str {
        "redb"
    }

    async fn connect(&self) -> PersistenceResult<()> {
        if self.db.lock().is_some() {
            return Ok(());
        }

        let path = self.path.clone();
        let db = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(storage)?;
            }
            let db = Database::create(&path).map_err(storage)?;

            // Ensure tables exist
            let write_txn = db.begin_write().map_err(storage)?;
            write_txn.open_table(DATAPOINT_LOG).map_err(storage)?;
            write_txn.open_table(CONTROL_LOG).map_err(storage)?;
            write_txn.open_table(SAMPLES).map_err(storage)?;
            write_txn.open_table(SAMPLE_DATA_LOG).map_err(storage)?;
            write_txn.commit().map_err(storage)?;
            Ok::<_, PersistenceError>(db)
        })
        .await
        .map_err(storage)??;

        info!(persistence = %self.name, path = %self.path.display(), "redb persistence connected");
        *self.db.lock() = Some(Arc::new(db));
        Ok(())
    }

    async fn insert_datapoint_rows(&self, rows: Vec<DatapointLogRow>) -> PersistenceResult<()> {
        let rows = rows
            .into_iter()
            .map(|r| (r.changed_at, r.datapoint_id.clone(), r))
            .collect();
        self.insert(DATAPOINT_LOG, rows).await
    }

    async fn select_datapoint_rows(
        &self,
        range: TimeRange,
    ) -> PersistenceResult<Vec<DatapointLogRow>> {
        self.select(DATAPOINT_LOG, range).await
    }

    async fn insert_control_rows(&self, rows: Vec<ControlLogRow>) -> PersistenceResult<()> {
        let rows = rows
            .into_iter()
            .map(|r| (r.logged_at, format!("{}/{}", r.device_id, r.datapoint_id), r))
            .collect();
        self.insert(CONTROL_LOG, rows).await
    }

    async fn select_control_rows(&self, range: TimeRange) -> PersistenceResult<Vec<ControlLogRow>> {
        self.select(CONTROL_LOG, range).await
    }

    async fn upsert_sample(&self, sample: Sample) -> PersistenceResult<()> {
        let value = encode(&sample)?;
        self.write(SAMPLES, vec![(sample.sample_id, value)]).await
    }

    async fn select_samples(&self) -> PersistenceResult<Vec<Sample>> {
        self.select_keys(SAMPLES, None).await
    }

    async fn insert_sample_rows(&self, rows: Vec<SampleDataRow>) -> PersistenceResult<()> {
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let key = format!("{}:{}", row.sample_id, self.row_key(row.changed_at, &row.datapoint_id));
            entries.push((key, encode(&row)?));
        }
        self.write(SAMPLE_DATA_LOG, entries).await
    }

    async fn select_sample_rows(
        &self,
        sample_id: &str,
        range: TimeRange,
    ) -> PersistenceResult<Vec<SampleDataRow>> {
        let start = format!("{sample_id}:{}", time_key(range.from));
        let end = format!("{sample_id}:{}", time_key(range.to));
        self.select_keys(SAMPLE_DATA_LOG, Some((start, end))).await
    }

    async fn disconnect(&self) -> PersistenceResult<()> {
        if self.db.lock().take().is_some() {
            info!(persistence = %self.name, "redb persistence disconnected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SampleDatapoint;
    use tempfile::tempdir;

    fn row(id: &str, at: i64) -> DatapointLogRow {
        DatapointLogRow {
            datapoint_id: id.to_string(),
            value_num: Some(1.5),
            value_string: None,
            changed_at: at,
        }
    }

    #[tokio::test]
    async fn test_rows_survive_reconnect() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("castle.redb");
        let store = RedbPersistence::new("db", &path);

        assert!(matches!(
            store.insert_datapoint_rows(vec![row("a", 1)]).await,
            Err(PersistenceError::NotConnected(_))
        ));

        store.connect().await.unwrap();
        store
            .insert_datapoint_rows(vec![row("b", 2000), row("a", 1000), row("a", 3000)])
            .await
            .unwrap();
        store.disconnect().await.unwrap();

        let store = RedbPersistence::new("db", &path);
        store.connect().await.unwrap();
        let rows = store
            .select_datapoint_rows(TimeRange::new(1000, 3000))
            .await
            .unwrap();
        let found: Vec<(&str, i64)> = rows
            .iter()
            .map(|r| (r.datapoint_id.as_str(), r.changed_at))
            .collect();
        assert_eq!(found, vec![("a", 1000), ("b", 2000)]);
    }

    #[tokio::test]
    async fn test_control_rows() {
        let dir = tempdir().unwrap();
        let store = RedbPersistence::new("db", dir.path().join("castle.redb"));
        store.connect().await.unwrap();

        let row = ControlLogRow {
            device_id: "boiler".into(),
            datapoint_id: "setpoint".into(),
            value_num: Some(55.0),
            value_string: None,
            executed: true,
            success: false,
            error: Some("timeout".into()),
            logged_at: 42,
        };
        store.insert_control_rows(vec![row.clone()]).await.unwrap();
        let rows = store.select_control_rows(TimeRange::new(0, 100)).await.unwrap();
        assert_eq!(rows, vec![row]);
        assert!(store
            .select_datapoint_rows(TimeRange::new(0, 100))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_samples_survive_reconnect() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("castle.redb");
        let store = RedbPersistence::new("db", &path);
        store.connect().await.unwrap();

        let sample = Sample {
            sample_id: "heating-curve".into(),
            name: "Heating curve".into(),
            description: Some("Boiler against outdoor temperature".into()),
            length_ms: Some(86_400_000),
            datapoints: vec![SampleDatapoint {
                datapoint_id: "temp@boiler".into(),
                name: "Boiler".into(),
                value_type: castle_types::ValueType::Number,
                value_unit: Some("°C".into()),
                description: None,
                meaning: Some("flow".into()),
            }],
        };
        store.upsert_sample(sample.clone()).await.unwrap();
        let rows: Vec<SampleDataRow> = [(1000, 40.0), (2000, 42.0), (3000, 45.0)]
            .into_iter()
            .map(|(at, value)| SampleDataRow {
                sample_id: "heating-curve".into(),
                datapoint_id: "temp@boiler".into(),
                value_num: Some(value),
                value_string: None,
                changed_at: at,
            })
            .collect();
        store.insert_sample_rows(rows).await.unwrap();
        store
            .insert_sample_rows(vec![SampleDataRow {
                sample_id: "heating-curve-2".into(),
                datapoint_id: "temp@boiler".into(),
                value_num: Some(1.0),
                value_string: None,
                changed_at: 1500,
            }])
            .await
            .unwrap();
        store.disconnect().await.unwrap();

        let store = RedbPersistence::new("db", &path);
        store.connect().await.unwrap();
        assert_eq!(store.select_samples().await.unwrap(), vec![sample]);
        let values: Vec<f64> = store
            .select_sample_rows("heating-curve", TimeRange::new(1000, 3000))
            .await
            .unwrap()
            .iter()
            .filter_map(|r| r.value_num)
            .collect();
        assert_eq!(values, vec![40.0, 42.0]);
    }
}
