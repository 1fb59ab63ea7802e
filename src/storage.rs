//! Date-partitioned CSV log of derived measurements.
//!
//! Layout: `<base>/<YYYY-MM>/<YYYY-MM-DD>.csv`, one file per local calendar
//! day. The header is written once when a day file is created; every later
//! row is appended with a single write, and files are opened per call so no
//! handle is held between rows.

use crate::reading::{DERIVED_SOURCE, DerivedMeasurement, Event};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Column names of every day file.
pub const HEADER: [&str; 9] = [
    "timestamp",
    "sensor",
    "pressure",
    "temperature_barometer",
    "temperature_humidity",
    "humidity",
    "QNH",
    "QFE",
    "QFF",
];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CSV error in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        StorageError::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Row {
    timestamp: String,
    sensor: String,
    pressure: f64,
    temperature_barometer: f64,
    temperature_humidity: f64,
    humidity: f64,
    #[serde(rename = "QNH")]
    qnh: f64,
    #[serde(rename = "QFE")]
    qfe: f64,
    #[serde(rename = "QFF")]
    qff: f64,
}

impl From<&DerivedMeasurement> for Row {
    fn from(m: &DerivedMeasurement) -> Self {
        Row {
            timestamp: m.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            sensor: DERIVED_SOURCE.to_string(),
            pressure: m.pressure,
            temperature_barometer: m.temperature_barometer,
            temperature_humidity: m.temperature_humidity,
            humidity: m.humidity,
            qnh: m.qnh,
            qfe: m.qfe,
            qff: m.qff,
        }
    }
}

impl Row {
    fn into_measurement(self) -> Option<DerivedMeasurement> {
        let naive = NaiveDateTime::parse_from_str(&self.timestamp, TIMESTAMP_FORMAT).ok()?;
        let timestamp = Local.from_local_datetime(&naive).earliest()?;
        Some(DerivedMeasurement {
            timestamp,
            pressure: self.pressure,
            temperature_barometer: self.temperature_barometer,
            temperature_humidity: self.temperature_humidity,
            humidity: self.humidity,
            temperature_used: None,
            qnh: self.qnh,
            qfe: self.qfe,
            qff: self.qff,
        })
    }
}

/// Appends derived measurements to daily CSV files under a base directory.
#[derive(Debug, Clone)]
pub struct RotatingStore {
    base: PathBuf,
}

impl RotatingStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of the day file for `date`.
    pub fn partition_path(&self, date: NaiveDate) -> PathBuf {
        self.base
            .join(date.format("%Y-%m").to_string())
            .join(format!("{}.csv", date.format("%Y-%m-%d")))
    }

    /// Append one measurement to the file of its local calendar day.
    pub fn save(&self, measurement: &DerivedMeasurement) -> Result<(), StorageError> {
        let path = self.partition_path(measurement.timestamp.date_naive());
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
        }

        let (mut file, needs_header) = match OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => (file, true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .map_err(|e| StorageError::io(&path, e))?;
                // A file left empty by an interrupted first write still needs its header.
                let empty = file
                    .metadata()
                    .map_err(|e| StorageError::io(&path, e))?
                    .len()
                    == 0;
                (file, empty)
            }
            Err(e) => return Err(StorageError::io(&path, e)),
        };

        let mut encoder = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        if needs_header {
            encoder
                .write_record(HEADER)
                .map_err(|e| StorageError::csv(&path, e))?;
        }
        encoder
            .serialize(Row::from(measurement))
            .map_err(|e| StorageError::csv(&path, e))?;
        let bytes = encoder
            .into_inner()
            .map_err(|e| StorageError::io(&path, e.into_error()))?;

        file.write_all(&bytes)
            .map_err(|e| StorageError::io(&path, e))?;
        if needs_header {
            info!(path = %path.display(), "started new day file");
        }
        Ok(())
    }

    /// Persist `event` if it is a derived measurement.
    ///
    /// Returns whether anything was written.
    pub fn record(&self, event: &Event) -> Result<bool, StorageError> {
        match event {
            Event::Derived(measurement) => self.save(measurement).map(|()| true),
            Event::Raw(_) | Event::Connection(_) => Ok(false),
        }
    }

    /// Load the measurements stamped within `[start, end]`, both optional.
    pub fn load(
        &self,
        start: Option<DateTime<Local>>,
        end: Option<DateTime<Local>>,
    ) -> Result<Vec<DerivedMeasurement>, StorageError> {
        self.search(None, start, end)
    }

    /// Like [`load`](Self::load), keeping only rows whose `sensor` column
    /// equals `sensor` when given.
    pub fn search(
        &self,
        sensor: Option<&str>,
        start: Option<DateTime<Local>>,
        end: Option<DateTime<Local>>,
    ) -> Result<Vec<DerivedMeasurement>, StorageError> {
        let first_day = start.map(|t| t.date_naive());
        let last_day = end.map(|t| t.date_naive());

        let mut measurements = Vec::new();
        for (date, path) in self.partitions()? {
            if first_day.is_some_and(|d| date < d) || last_day.is_some_and(|d| date > d) {
                continue;
            }
            debug!(path = %path.display(), "scanning day file");

            let mut reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .from_path(&path)
                .map_err(|e| StorageError::csv(&path, e))?;
            for (index, row) in reader.deserialize::<Row>().enumerate() {
                let row = match row {
                    Ok(row) => row,
                    Err(e) => {
                        warn!(path = %path.display(), row = index + 1, error = %e, "skipping malformed row");
                        continue;
                    }
                };
                if sensor.is_some_and(|s| s != row.sensor) {
                    continue;
                }
                let Some(measurement) = row.into_measurement() else {
                    warn!(path = %path.display(), row = index + 1, "skipping row with invalid timestamp");
                    continue;
                };
                if start.is_some_and(|t| measurement.timestamp < t)
                    || end.is_some_and(|t| measurement.timestamp > t)
                {
                    continue;
                }
                measurements.push(measurement);
            }
        }
        Ok(measurements)
    }

    /// Every day file under the base directory, in date order.
    fn partitions(&self) -> Result<Vec<(NaiveDate, PathBuf)>, StorageError> {
        let mut partitions = Vec::new();
        for month in read_dir_sorted(&self.base)? {
            if !month.is_dir() {
                continue;
            }
            for day in read_dir_sorted(&month)? {
                let date = day
                    .extension()
                    .filter(|ext| *ext == "csv")
                    .and_then(|_| day.file_stem())
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok());
                if let Some(date) = date {
                    partitions.push((date, day));
                }
            }
        }
        partitions.sort();
        Ok(partitions)
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::io(dir, e)),
    };
    let mut paths = entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| StorageError::io(dir, e))?;
    paths.sort();
    Ok(paths)
}

/// Drain `events` into `store` on a blocking thread until the channel closes.
///
/// Failed writes are logged and the measurement is dropped. The task returns
/// the number of rows written.
pub fn spawn_writer(
    store: RotatingStore,
    mut events: mpsc::UnboundedReceiver<Event>,
) -> JoinHandle<usize> {
    tokio::task::spawn_blocking(move || {
        let mut written = 0;
        while let Some(event) = events.blocking_recv() {
            match store.record(&event) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => error!(error = %e, "dropping measurement"),
            }
        }
        info!(rows = written, base = %store.base().display(), "storage writer finished");
        written
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::ConnectionState;
    use crate::reading::{ConnectionChange, Sample, SensorReading, SensorRole};
    use crate::test_utils::{derived_measurement, local_time};

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_partition_path() {
        let store = RotatingStore::new("data");
        let date = NaiveDate::from_ymd_opt(2024, 8, 9).unwrap();
        assert_eq!(
            store.partition_path(date),
            Path::new("data").join("2024-08").join("2024-08-09.csv")
        );
    }

    #[test]
    fn test_save_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = RotatingStore::new(dir.path());

        store.save(&derived_measurement(local_time(2024, 8, 19, 10, 0, 0))).unwrap();
        store.save(&derived_measurement(local_time(2024, 8, 19, 10, 0, 1))).unwrap();

        let path = store.partition_path(NaiveDate::from_ymd_opt(2024, 8, 19).unwrap());
        let content = lines(&path);
        assert_eq!(content.len(), 3);
        assert_eq!(content[0], HEADER.join(","));
        assert_eq!(
            content[1],
            "2024-08-19 10:00:00,derived,1005.87,26.75,27.1,38.7,1011.93,1006.05,1011.58"
        );
    }

    #[test]
    fn test_save_to_empty_day_file_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = RotatingStore::new(dir.path());
        let path = store.partition_path(NaiveDate::from_ymd_opt(2024, 8, 19).unwrap());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::File::create(&path).unwrap();

        for sec in 0..3 {
            store.save(&derived_measurement(local_time(2024, 8, 19, 10, 0, sec))).unwrap();
        }

        let content = lines(&path);
        assert_eq!(content.len(), 4);
        assert_eq!(content[0], HEADER.join(","));
        assert_eq!(content.iter().filter(|l| l.starts_with("timestamp,")).count(), 1);
        assert_eq!(store.load(None, None).unwrap().len(), 3);
    }

    #[test]
    fn test_midnight_rollover_splits_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = RotatingStore::new(dir.path());

        store.save(&derived_measurement(local_time(2024, 8, 31, 23, 59, 59))).unwrap();
        store.save(&derived_measurement(local_time(2024, 9, 1, 0, 0, 1))).unwrap();

        let before = store.partition_path(NaiveDate::from_ymd_opt(2024, 8, 31).unwrap());
        let after = store.partition_path(NaiveDate::from_ymd_opt(2024, 9, 1).unwrap());
        assert!(before.ends_with("2024-08/2024-08-31.csv"));
        assert!(after.ends_with("2024-09/2024-09-01.csv"));

        for (path, stamp) in [(before, "2024-08-31 23:59:59"), (after, "2024-09-01 00:00:01")] {
            let content = lines(&path);
            assert_eq!(content.len(), 2);
            assert_eq!(content.iter().filter(|l| l.starts_with("timestamp,")).count(), 1);
            assert!(content[1].starts_with(stamp));
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RotatingStore::new(dir.path());
        let saved: Vec<DerivedMeasurement> = (0..5)
            .map(|i| {
                let mut m = derived_measurement(local_time(2024, 8, 19, 12, i, 30));
                m.pressure += f64::from(i);
                m.temperature_used = None;
                m
            })
            .collect();
        for m in &saved {
            store.save(m).unwrap();
        }

        assert_eq!(store.load(None, None).unwrap(), saved);
    }

    #[test]
    fn test_load_filters_by_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = RotatingStore::new(dir.path());
        for day in [17, 18, 19, 20] {
            store.save(&derived_measurement(local_time(2024, 8, day, 12, 0, 0))).unwrap();
        }

        let loaded = store
            .load(
                Some(local_time(2024, 8, 18, 0, 0, 0)),
                Some(local_time(2024, 8, 19, 12, 0, 0)),
            )
            .unwrap();
        let stamps: Vec<_> = loaded.iter().map(|m| m.timestamp).collect();
        assert_eq!(
            stamps,
            vec![
                local_time(2024, 8, 18, 12, 0, 0),
                local_time(2024, 8, 19, 12, 0, 0)
            ]
        );

        let open_ended = store.load(Some(local_time(2024, 8, 20, 0, 0, 0)), None).unwrap();
        assert_eq!(open_ended.len(), 1);
    }

    #[test]
    fn test_search_by_sensor() {
        let dir = tempfile::tempdir().unwrap();
        let store = RotatingStore::new(dir.path());
        store.save(&derived_measurement(local_time(2024, 8, 19, 8, 0, 0))).unwrap();

        assert_eq!(store.search(Some(DERIVED_SOURCE), None, None).unwrap().len(), 1);
        assert!(store.search(Some("barometer"), None, None).unwrap().is_empty());
    }

    #[test]
    fn test_load_skips_malformed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = RotatingStore::new(dir.path());
        store.save(&derived_measurement(local_time(2024, 8, 19, 8, 0, 0))).unwrap();

        let path = store.partition_path(NaiveDate::from_ymd_opt(2024, 8, 19).unwrap());
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "2024-08-19 08:00:01,derived,not-a-number,1,2,3,4,5,6").unwrap();
        writeln!(file, "yesterday,derived,1,2,3,4,5,6,7").unwrap();
        store.save(&derived_measurement(local_time(2024, 8, 19, 8, 0, 2))).unwrap();

        assert_eq!(store.load(None, None).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_base_dir_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = RotatingStore::new(dir.path().join("nope"));
        assert!(store.load(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_record_persists_only_derived() {
        let dir = tempfile::tempdir().unwrap();
        let store = RotatingStore::new(dir.path());
        let at = local_time(2024, 8, 19, 9, 0, 0);

        let raw = Event::Raw(SensorReading {
            timestamp: at,
            sample: Sample::Barometer {
                pressure: 1005.87,
                temperature: 26.75,
            },
        });
        let change = Event::Connection(ConnectionChange {
            timestamp: at,
            role: SensorRole::Hygrometer,
            from: ConnectionState::Connected,
            to: ConnectionState::Stale,
        });

        assert!(!store.record(&raw).unwrap());
        assert!(!store.record(&change).unwrap());
        assert!(!dir.path().join("2024-08").exists());
        assert!(store.record(&Event::Derived(derived_measurement(at))).unwrap());
        assert_eq!(store.load(None, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_writer_drains_channel() {
        let dir = tempfile::tempdir().unwrap();
        let store = RotatingStore::new(dir.path());
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = spawn_writer(store.clone(), rx);

        for sec in 0..3 {
            tx.send(Event::Derived(derived_measurement(local_time(2024, 8, 19, 9, 0, sec))))
                .unwrap();
        }
        drop(tx);

        assert_eq!(writer.await.unwrap(), 3);
        assert_eq!(store.load(None, None).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_writer_keeps_draining_after_storage_errors() {
        // A regular file as base directory makes every save fail.
        let base = tempfile::NamedTempFile::new().unwrap();
        let store = RotatingStore::new(base.path());
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = spawn_writer(store, rx);

        for sec in 0..3 {
            tx.send(Event::Derived(derived_measurement(local_time(2024, 8, 19, 9, 0, sec))))
                .unwrap();
        }
        drop(tx);

        assert_eq!(writer.await.unwrap(), 0);
        assert_eq!(fs::metadata(base.path()).unwrap().len(), 0);
    }
}
