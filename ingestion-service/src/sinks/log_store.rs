//! Append-only per-device daily log of ingested readings.
//!
//! Layout: `<root>/<deviceId>/device<deviceId>-<YYYY-MM-DD>.log`, one JSON
//! object per line. The log is a secondary history source and is written
//! after the relational store, so it may lag or miss lines the store has.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::{format_description::FormatItem, macros::format_description, Date, OffsetDateTime};
use tokio::{io::AsyncWriteExt, sync::Mutex};

pub const LOG_SCHEMA_VERSION: u32 = 1;

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

#[derive(thiserror::Error, Debug)]
pub enum LogStoreError {
    #[error("log io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode log record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Error,
    #[serde(other)]
    Unknown,
}

impl std::str::FromStr for LogStatus {
    type Err = String;

    /// Only the two written tags parse; `Unknown` is read-side only.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub v: u32,
    pub device_id: i64,
    pub sensor_id: Option<i64>,
    pub sensor_name: Option<String>,
    pub value: Option<String>,
    pub unit: Option<String>,
    pub is_alarm: Option<bool>,
    pub is_line: Option<bool>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub status: LogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Inclusive time window; an open end is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
}

impl TimeRange {
    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts <= e)
    }

    fn contains_date(&self, date: Date) -> bool {
        let utc = |ts: OffsetDateTime| ts.to_offset(time::UtcOffset::UTC).date();
        self.start.map_or(true, |s| date >= utc(s)) && self.end.map_or(true, |e| date <= utc(e))
    }
}

/// Record selection for [`LogStore::query`]; `None` fields match anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub range: TimeRange,
    pub sensor_id: Option<i64>,
    pub status: Option<LogStatus>,
}

impl LogFilter {
    fn matches(&self, record: &LogRecord) -> bool {
        self.range.contains(record.timestamp)
            && self.sensor_id.map_or(true, |id| record.sensor_id == Some(id))
            && self.status.map_or(true, |status| record.status == status)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogQuery {
    /// Oldest first.
    pub records: Vec<LogRecord>,
    /// Lines that were malformed or carried an unknown schema version.
    pub skipped: usize,
}

pub struct LogStore {
    root: PathBuf,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl LogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn device_dir(&self, device_id: i64) -> PathBuf {
        self.root.join(device_id.to_string())
    }

    pub fn file_path(&self, device_id: i64, date: Date) -> PathBuf {
        self.device_dir(device_id).join(log_file_name(device_id, date))
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks.entry(path.to_path_buf()).or_default().clone()
    }

    /// Append `records` to the device's file for `date` as a single write.
    pub async fn append(&self, device_id: i64, date: Date, records: &[LogRecord]) -> Result<usize, LogStoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut buf = Vec::with_capacity(records.len() * 192);
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let path = self.file_path(device_id, date);
        let io_err = |source| LogStoreError::Io {
            path: path.clone(),
            source,
        };

        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        // The sweeper may remove an emptied device directory between
        // `create_dir_all` and `open`; one retry recreates it.
        let mut file = match open_append(&path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => open_append(&path).await,
            other => other,
        }
        .map_err(io_err)?;
        file.write_all(&buf).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;

        metrics::counter!("log_lines_written_total").increment(records.len() as u64);
        Ok(records.len())
    }

    /// Records of `device_id` within `range`, the most recent `limit` of
    /// them, oldest first.
    pub async fn read(&self, device_id: i64, range: TimeRange, limit: usize) -> Result<LogQuery, LogStoreError> {
        let filter = LogFilter {
            range,
            ..LogFilter::default()
        };
        self.query(device_id, &filter, limit).await
    }

    /// Like [`LogStore::read`], additionally narrowed by sensor and status.
    pub async fn query(&self, device_id: i64, filter: &LogFilter, limit: usize) -> Result<LogQuery, LogStoreError> {
        let mut query = LogQuery::default();
        if limit == 0 {
            return Ok(query);
        }

        let mut files: Vec<(Date, PathBuf)> = Vec::new();
        for (path, file_device, date) in self.list_device_files(device_id).await? {
            if file_device == device_id && filter.range.contains_date(date) {
                files.push((date, path));
            }
        }
        files.sort();

        for (_, path) in files {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "skipping unreadable log file");
                    continue;
                }
            };

            let skipped_before = query.skipped;
            // The segment after the last newline is either empty or a line still
            // being written.
            let complete = match bytes.iter().rposition(|b| *b == b'\n') {
                Some(last) => &bytes[..last],
                None => continue,
            };
            for line in complete.split(|b| *b == b'\n') {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match parse_line(line) {
                    Some(record) if filter.matches(&record) => query.records.push(record),
                    Some(_) => {}
                    None => query.skipped += 1,
                }
            }

            let skipped = query.skipped - skipped_before;
            if skipped > 0 {
                tracing::warn!(path = %path.display(), skipped, "skipped malformed log lines");
                metrics::counter!("log_lines_skipped_total").increment(skipped as u64);
            }
        }

        query.records.sort_by_key(|r| r.timestamp);
        if query.records.len() > limit {
            let excess = query.records.len() - limit;
            query.records.drain(..excess);
        }

        Ok(query)
    }

    /// Log files under the device's directory whose names parse, as
    /// `(path, device_id, date)`. A missing directory yields nothing.
    pub async fn list_device_files(&self, device_id: i64) -> Result<Vec<(PathBuf, i64, Date)>, LogStoreError> {
        list_log_files(&self.device_dir(device_id)).await
    }

    /// Delete a log file while holding its append lock.
    pub async fn remove_file(&self, path: &Path) -> io::Result<()> {
        let lock = self.lock_for(path);
        let guard = lock.lock().await;
        let result = tokio::fs::remove_file(path).await;
        // Drop the table entry unless another task is already waiting on it.
        self.locks.remove_if(path, |_, l| Arc::strong_count(l) <= 2);
        drop(guard);
        result
    }
}

async fn open_append(path: &Path) -> io::Result<tokio::fs::File> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::OpenOptions::new().create(true).append(true).open(path).await
}

pub(crate) async fn list_log_files(dir: &Path) -> Result<Vec<(PathBuf, i64, Date)>, LogStoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(LogStoreError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut files = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(source) => {
                return Err(LogStoreError::Io {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };
        let name = entry.file_name();
        if let Some((device_id, date)) = name.to_str().and_then(parse_log_file_name) {
            files.push((entry.path(), device_id, date));
        }
    }
    Ok(files)
}

fn parse_line(line: &[u8]) -> Option<LogRecord> {
    let record: LogRecord = serde_json::from_slice(line).ok()?;
    (record.v == LOG_SCHEMA_VERSION).then_some(record)
}

pub fn log_file_name(device_id: i64, date: Date) -> String {
    // `Date::format` only fails for years beyond four digits.
    let date = date
        .format(DATE_FORMAT)
        .unwrap_or_else(|_| format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day()));
    format!("device{device_id}-{date}.log")
}

/// `device<id>-<YYYY-MM-DD>.log` -> `(id, date)`.
pub fn parse_log_file_name(name: &str) -> Option<(i64, Date)> {
    let stem = name.strip_prefix("device")?.strip_suffix(".log")?;
    let split = stem.len().checked_sub(10)?;
    if !stem.is_char_boundary(split) {
        return None;
    }
    let (id, date) = stem.split_at(split);
    let id = id.strip_suffix('-')?;
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((id.parse().ok()?, Date::parse(date, DATE_FORMAT).ok()?))
}

#[cfg(test)]
mod tests {
    use time::macros::{date, datetime};

    use super::*;

    fn record(device_id: i64, sensor_id: i64, ts: OffsetDateTime, value: &str) -> LogRecord {
        LogRecord {
            v: LOG_SCHEMA_VERSION,
            device_id,
            sensor_id: Some(sensor_id),
            sensor_name: None,
            value: Some(value.to_string()),
            unit: Some("mm".to_string()),
            is_alarm: Some(false),
            is_line: Some(true),
            timestamp: ts,
            status: LogStatus::Success,
            message: None,
        }
    }

    #[tokio::test]
    async fn append_then_read_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let day = date!(2024 - 03 - 01);

        let records: Vec<LogRecord> = (0..5)
            .map(|i| record(2864, 11922, datetime!(2024-03-01 10:00:00 UTC) + time::Duration::minutes(i), &i.to_string()))
            .collect();
        // written out of order on purpose
        store.append(2864, day, &records[3..]).await.unwrap();
        store.append(2864, day, &records[..3]).await.unwrap();

        assert!(dir.path().join("2864").join("device2864-2024-03-01.log").exists());

        let q = store.read(2864, TimeRange::default(), 3).await.unwrap();
        let values: Vec<_> = q.records.iter().map(|r| r.value.clone().unwrap()).collect();
        assert_eq!(values, vec!["2", "3", "4"]);
        assert_eq!(q.skipped, 0);

        let none = store.read(2864, TimeRange::default(), 0).await.unwrap();
        assert!(none.records.is_empty());
    }

    #[tokio::test]
    async fn corrupt_and_partial_lines_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let day = date!(2024 - 03 - 01);
        let ts = datetime!(2024-03-01 10:00:00 UTC);

        store.append(7, day, &[record(7, 1, ts, "1")]).await.unwrap();

        let path = store.file_path(7, day);
        let mut contents = tokio::fs::read_to_string(&path).await.unwrap();
        contents.push_str("not json\n");
        contents.push_str("{\"v\":2,\"deviceId\":7,\"timestamp\":\"2024-03-01T10:05:00Z\",\"status\":\"success\"}\n");
        contents.push_str("{\"v\":1,\"deviceId\":7,\"timestamp\":\"2024-03-01T10:06:00Z\",\"status\":\"pending\"}\n");
        contents.push_str("{\"v\":1,\"deviceId\":7,\"sensorId\":1,\"val");
        tokio::fs::write(&path, contents).await.unwrap();

        let q = store.read(7, TimeRange::default(), 50).await.unwrap();
        assert_eq!(q.skipped, 2);
        assert_eq!(q.records.len(), 2);

        let sparse = &q.records[1];
        assert_eq!(sparse.sensor_id, None);
        assert_eq!(sparse.value, None);
        assert_eq!(sparse.status, LogStatus::Unknown);
    }

    #[tokio::test]
    async fn range_selects_files_and_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path());

        for (day, ts) in [
            (date!(2024 - 02 - 28), datetime!(2024-02-28 23:00:00 UTC)),
            (date!(2024 - 02 - 29), datetime!(2024-02-29 06:00:00 UTC)),
            (date!(2024 - 02 - 29), datetime!(2024-02-29 18:00:00 UTC)),
            (date!(2024 - 03 - 01), datetime!(2024-03-01 01:00:00 UTC)),
        ] {
            store.append(5, day, &[record(5, 1, ts, "x")]).await.unwrap();
        }

        let range = TimeRange {
            start: Some(datetime!(2024-02-29 12:00:00 UTC)),
            end: Some(datetime!(2024-03-01 00:30:00 UTC)),
        };
        let q = store.read(5, range, 50).await.unwrap();
        let stamps: Vec<_> = q.records.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![datetime!(2024-02-29 18:00:00 UTC)]);

        let unknown = store.read(6, TimeRange::default(), 50).await.unwrap();
        assert_eq!(unknown, LogQuery::default());
    }

    #[tokio::test]
    async fn query_narrows_by_sensor_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let day = date!(2024 - 03 - 01);
        let ts = datetime!(2024-03-01 10:00:00 UTC);

        let mut failed = record(4, 2, ts + time::Duration::minutes(1), "2");
        failed.status = LogStatus::Error;
        failed.message = Some("store unavailable".to_string());
        store
            .append(4, day, &[record(4, 1, ts, "1"), failed, record(4, 2, ts + time::Duration::minutes(2), "3")])
            .await
            .unwrap();

        let by_sensor = LogFilter {
            sensor_id: Some(2),
            ..LogFilter::default()
        };
        let q = store.query(4, &by_sensor, 50).await.unwrap();
        let values: Vec<_> = q.records.iter().map(|r| r.value.clone().unwrap()).collect();
        assert_eq!(values, vec!["2", "3"]);

        let errors = LogFilter {
            status: Some(LogStatus::Error),
            ..LogFilter::default()
        };
        let q = store.query(4, &errors, 50).await.unwrap();
        assert_eq!(q.records.len(), 1);
        assert_eq!(q.records[0].message.as_deref(), Some("store unavailable"));

        assert_eq!(" Error ".parse::<LogStatus>(), Ok(LogStatus::Error));
        assert!("pending".parse::<LogStatus>().is_err());
    }

    #[tokio::test]
    async fn concurrent_appends_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LogStore::new(dir.path()));
        let day = date!(2024 - 03 - 01);
        let base = datetime!(2024-03-01 00:00:00 UTC);

        let mut tasks = Vec::new();
        for t in 0..16i64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let batch: Vec<LogRecord> = (0..8)
                    .map(|i| record(1, t, base + time::Duration::seconds(t * 8 + i), &"v".repeat(64)))
                    .collect();
                store.append(1, day, &batch).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let q = store.read(1, TimeRange::default(), 1_000).await.unwrap();
        assert_eq!(q.skipped, 0);
        assert_eq!(q.records.len(), 128);
    }

    #[tokio::test]
    async fn appends_survive_concurrent_directory_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LogStore::new(dir.path()));
        let day = date!(2024 - 03 - 01);
        let device_dir = store.device_dir(9);

        let remover = tokio::spawn(async move {
            for _ in 0..200 {
                if let Ok(mut entries) = tokio::fs::read_dir(&device_dir).await {
                    while let Ok(Some(entry)) = entries.next_entry().await {
                        let _ = tokio::fs::remove_file(entry.path()).await;
                    }
                }
                let _ = tokio::fs::remove_dir(&device_dir).await;
                tokio::task::yield_now().await;
            }
        });

        for i in 0..200 {
            let ts = datetime!(2024-03-01 00:00:00 UTC) + time::Duration::seconds(i);
            store.append(9, day, &[record(9, 1, ts, "1")]).await.unwrap();
            tokio::task::yield_now().await;
        }
        remover.await.unwrap();

        store
            .append(9, day, &[record(9, 1, datetime!(2024-03-01 01:00:00 UTC), "last")])
            .await
            .unwrap();
        assert!(store.file_path(9, day).exists());
    }

    #[tokio::test]
    async fn remove_file_deletes_and_forgets_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let day = date!(2024 - 03 - 01);
        store
            .append(3, day, &[record(3, 1, datetime!(2024-03-01 00:00:00 UTC), "1")])
            .await
            .unwrap();

        let path = store.file_path(3, day);
        store.remove_file(&path).await.unwrap();
        assert!(!path.exists());
        assert!(store.locks.is_empty());
        assert!(store.remove_file(&path).await.is_err());
    }

    #[test]
    fn file_names_round_trip_through_the_parser() {
        assert_eq!(log_file_name(2864, date!(2024 - 03 - 01)), "device2864-2024-03-01.log");
        assert_eq!(
            parse_log_file_name("device2864-2024-03-01.log"),
            Some((2864, date!(2024 - 03 - 01)))
        );

        for bad in [
            "device2864-2024-02-30.log",
            "device-2024-03-01.log",
            "deviceab-2024-03-01.log",
            "device2864_2024-03-01.log",
            "device2864-2024-03-01.txt",
            "notes.log",
        ] {
            assert_eq!(parse_log_file_name(bad), None, "{bad}");
        }
    }
}
