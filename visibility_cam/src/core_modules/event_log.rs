// THEORY:
// The event log is the system's memory: every reading, every state transition and
// every recording warning is appended as a `LogRecord`, and can be queried back per
// camera and time range for reporting.
//
// Two layers:
// 1.  **Sinks** (`EventLogSink`): synchronous storage with `append` and `query`.
//     `MemoryEventLog` is a ring buffer; `JsonlEventLog` appends one JSON object
//     per line to a file and scans it on query.
// 2.  **Writer** (`EventLogWriter`): the only thing camera units touch. `submit`
//     never blocks and never fails: records land in a bounded queue that drops its
//     oldest entry on overflow (counting the drops), and a background task drains
//     the queue into the sink on the blocking pool. A slow disk therefore costs
//     old log records, never frames.
//
// Per camera, records enter the queue in production order and the drain task
// preserves that order.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core_modules::estimator::VisibilityReading;
use crate::core_modules::event_state::{EventTransition, Mode};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    StreamUnavailable,
    InvalidFrame,
    EncoderStartFailure,
    EncoderFinalizeTimeout,
    EncoderError,
    HighlightFailure,
    RegionAlert,
}

/// A non-fatal problem worth keeping next to the readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub camera_id: String,
    pub at: DateTime<Utc>,
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn now(camera_id: impl Into<String>, kind: WarningKind, message: impl Into<String>) -> Self {
        Warning { camera_id: camera_id.into(), at: Utc::now(), kind, message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRecord {
    Reading(VisibilityReading),
    Transition(EventTransition),
    Warning(Warning),
}

impl LogRecord {
    pub fn camera_id(&self) -> &str {
        match self {
            LogRecord::Reading(r) => &r.camera_id,
            LogRecord::Transition(t) => &t.camera_id,
            LogRecord::Warning(w) => &w.camera_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LogRecord::Reading(r) => r.timestamp,
            LogRecord::Transition(t) => t.at,
            LogRecord::Warning(w) => w.at,
        }
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        TimeRange { start, end }
    }

    /// The whole timeline.
    pub fn all() -> Self {
        TimeRange { start: DateTime::<Utc>::MIN_UTC, end: DateTime::<Utc>::MAX_UTC }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

pub trait EventLogSink: Send + Sync {
    fn append(&self, record: LogRecord) -> Result<()>;

    /// Records of `camera_id` inside `range`, ordered by timestamp.
    fn query(&self, camera_id: &str, range: &TimeRange) -> Result<Vec<LogRecord>>;
}

fn select(records: impl Iterator<Item = LogRecord>, camera_id: &str, range: &TimeRange) -> Vec<LogRecord> {
    let mut selected: Vec<LogRecord> = records
        .filter(|r| r.camera_id() == camera_id && range.contains(r.timestamp()))
        .collect();
    selected.sort_by_key(LogRecord::timestamp);
    selected
}

/// Ring buffer sink.
pub struct MemoryEventLog {
    records: RwLock<VecDeque<LogRecord>>,
    capacity: usize,
}

impl MemoryEventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        MemoryEventLog { records: RwLock::new(VecDeque::with_capacity(capacity.min(4_096))), capacity }
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl EventLogSink for MemoryEventLog {
    fn append(&self, record: LogRecord) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }

    fn query(&self, camera_id: &str, range: &TimeRange) -> Result<Vec<LogRecord>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(select(records.iter().cloned(), camera_id, range))
    }
}

/// JSON-lines file sink.
pub struct JsonlEventLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlEventLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(JsonlEventLog { path, writer: Mutex::new(BufWriter::new(file)) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventLogSink for JsonlEventLog {
    fn append(&self, record: LogRecord) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn query(&self, camera_id: &str, range: &TimeRange) -> Result<Vec<LogRecord>> {
        // Hold the writer lock so no half-written line is read.
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => debug!(path = %self.path.display(), line = number + 1, "skipping unreadable log line: {e}"),
            }
        }
        Ok(select(records.into_iter(), camera_id, range))
    }
}

struct LogQueue {
    records: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Non-blocking front of an `EventLogSink`.
#[derive(Clone)]
pub struct EventLogWriter {
    queue: Arc<LogQueue>,
}

impl EventLogWriter {
    /// Starts the drain task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn EventLogSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let queue = Arc::new(LogQueue {
            records: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let handle = tokio::spawn(drain(Arc::clone(&queue), sink));
        (EventLogWriter { queue }, handle)
    }

    /// Enqueues a record, evicting the oldest queued record when full.
    pub fn submit(&self, record: LogRecord) {
        {
            let mut records = self.queue.records.lock().unwrap_or_else(PoisonError::into_inner);
            if records.len() >= self.queue.capacity {
                records.pop_front();
                let dropped = self.queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(dropped, "event log queue full, dropping oldest records");
                }
            }
            records.push_back(record);
        }
        self.queue.notify.notify_one();
    }

    /// Records evicted before reaching the sink.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Lets the drain task finish once the queue is empty.
    pub fn close(&self) {
        self.queue.closed.store(true, Ordering::Release);
        self.queue.notify.notify_one();
    }
}

async fn drain(queue: Arc<LogQueue>, sink: Arc<dyn EventLogSink>) {
    loop {
        let batch: Vec<LogRecord> = {
            let mut records = queue.records.lock().unwrap_or_else(PoisonError::into_inner);
            records.drain(..).collect()
        };
        if batch.is_empty() {
            if queue.closed.load(Ordering::Acquire) {
                break;
            }
            queue.notify.notified().await;
            continue;
        }
        let sink = Arc::clone(&sink);
        let written = tokio::task::spawn_blocking(move || {
            for record in batch {
                if let Err(e) = sink.append(record) {
                    warn!("event log append failed: {e}");
                }
            }
        })
        .await;
        if let Err(e) = written {
            warn!("event log drain task failed: {e}");
        }
    }
    debug!("event log writer stopped");
}

/// Aggregate view of one camera's log over a range.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogSummary {
    pub readings: usize,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    pub mean_score: Option<f64>,
    pub events: usize,
    pub seconds_in_event: f64,
    pub warnings: usize,
}

impl LogSummary {
    /// Summarizes time-ordered records of one camera. An EVENT still open at
    /// the last record counts up to that record.
    pub fn from_records(records: &[LogRecord]) -> Self {
        let mut summary = LogSummary::default();
        let mut sum = 0.0;
        let mut open_since: Option<DateTime<Utc>> = None;
        let mut last_at: Option<DateTime<Utc>> = None;

        for record in records {
            last_at = Some(record.timestamp());
            match record {
                LogRecord::Reading(r) => {
                    summary.readings += 1;
                    sum += r.score;
                    summary.min_score = Some(summary.min_score.map_or(r.score, |m| m.min(r.score)));
                    summary.max_score = Some(summary.max_score.map_or(r.score, |m| m.max(r.score)));
                }
                LogRecord::Transition(t) => match t.to {
                    Mode::Event => {
                        summary.events += 1;
                        open_since = Some(t.at);
                    }
                    Mode::Normal => {
                        let start = t.window.map(|w| w.started_at).or(open_since);
                        if let Some(start) = start {
                            summary.seconds_in_event += seconds_between(start, t.at);
                        }
                        open_since = None;
                    }
                },
                LogRecord::Warning(_) => summary.warnings += 1,
            }
        }
        if let (Some(start), Some(end)) = (open_since, last_at) {
            summary.seconds_in_event += seconds_between(start, end);
        }
        if summary.readings > 0 {
            summary.mean_score = Some(sum / summary.readings as f64);
        }
        summary
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    ((end - start).num_milliseconds().max(0)) as f64 / 1_000.0
}

/// Queries `sink` and summarizes the result.
pub fn summarize(sink: &dyn EventLogSink, camera_id: &str, range: &TimeRange) -> Result<LogSummary> {
    Ok(LogSummary::from_records(&sink.query(camera_id, range)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::estimator::SubMetrics;
    use crate::core_modules::event_state::{EventWindow, ScoreMark, VisibilityStatus};
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 2, 7, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn reading(camera: &str, secs: i64, score: f64) -> LogRecord {
        LogRecord::Reading(VisibilityReading {
            camera_id: camera.into(),
            timestamp: t(secs),
            score,
            metrics: SubMetrics::default(),
            status: VisibilityStatus::Good,
            regions: None,
        })
    }

    fn transition(camera: &str, secs: i64, to: Mode, started: i64) -> LogRecord {
        let window = (to == Mode::Normal).then(|| EventWindow {
            started_at: t(started),
            ended_at: t(secs),
            worst: ScoreMark { score: 0.1, at: t(started) },
            best: ScoreMark { score: 0.6, at: t(secs) },
        });
        let from = if to == Mode::Event { Mode::Normal } else { Mode::Event };
        LogRecord::Transition(EventTransition { camera_id: camera.into(), from, to, at: t(secs), score: 0.2, window })
    }

    #[test]
    fn memory_query_filters_and_orders() {
        let log = MemoryEventLog::new(10);
        log.append(reading("a", 5, 0.5)).unwrap();
        log.append(reading("b", 1, 0.5)).unwrap();
        log.append(reading("a", 1, 0.4)).unwrap();
        log.append(reading("a", 9, 0.3)).unwrap();

        let records = log.query("a", &TimeRange::new(t(0), t(9))).unwrap();
        let times: Vec<_> = records.iter().map(LogRecord::timestamp).collect();
        assert_eq!(times, vec![t(1), t(5)]);
    }

    #[test]
    fn memory_ring_evicts_oldest() {
        let log = MemoryEventLog::new(2);
        for i in 0..3 {
            log.append(reading("a", i, 0.5)).unwrap();
        }
        assert_eq!(log.len(), 2);
        let records = log.query("a", &TimeRange::all()).unwrap();
        assert_eq!(records[0].timestamp(), t(1));
    }

    #[test]
    fn jsonl_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");
        {
            let log = JsonlEventLog::open(&path).unwrap();
            log.append(reading("a", 1, 0.7)).unwrap();
            log.append(transition("a", 2, Mode::Event, 2)).unwrap();
            log.append(LogRecord::Warning(Warning {
                camera_id: "a".into(),
                at: t(3),
                kind: WarningKind::EncoderStartFailure,
                message: "no codec".into(),
            }))
            .unwrap();
        }
        let log = JsonlEventLog::open(&path).unwrap();
        let records = log.query("a", &TimeRange::all()).unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[1], LogRecord::Transition(_)));
        assert!(matches!(&records[2], LogRecord::Warning(w) if w.kind == WarningKind::EncoderStartFailure));
    }

    #[test]
    fn summary_counts_event_time() {
        let records = vec![
            reading("a", 0, 0.8),
            transition("a", 10, Mode::Event, 10),
            reading("a", 10, 0.2),
            reading("a", 20, 0.1),
            transition("a", 40, Mode::Normal, 10),
            reading("a", 40, 0.6),
            transition("a", 50, Mode::Event, 50),
            reading("a", 55, 0.2),
        ];
        let summary = LogSummary::from_records(&records);
        assert_eq!(summary.readings, 5);
        assert_eq!(summary.events, 2);
        assert_eq!(summary.min_score, Some(0.1));
        assert_eq!(summary.max_score, Some(0.8));
        assert!((summary.mean_score.unwrap() - 0.38).abs() < 1e-9);
        assert!((summary.seconds_in_event - 35.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn writer_drains_in_order() {
        let sink = Arc::new(MemoryEventLog::new(100));
        let (writer, handle) = EventLogWriter::spawn(sink.clone(), 64);
        for i in 0..20 {
            writer.submit(reading("a", i, 0.5));
        }
        writer.close();
        handle.await.unwrap();
        let records = sink.query("a", &TimeRange::all()).unwrap();
        assert_eq!(records.len(), 20);
        assert_eq!(writer.dropped(), 0);
        assert_eq!(summarize(sink.as_ref(), "a", &TimeRange::all()).unwrap().readings, 20);
    }

    /// A sink that blocks until released, to back the queue up.
    struct GatedSink {
        gate: std::sync::Mutex<()>,
        inner: MemoryEventLog,
    }

    impl EventLogSink for GatedSink {
        fn append(&self, record: LogRecord) -> Result<()> {
            let _open = self.gate.lock().unwrap();
            self.inner.append(record)
        }

        fn query(&self, camera_id: &str, range: &TimeRange) -> Result<Vec<LogRecord>> {
            self.inner.query(camera_id, range)
        }
    }

    #[tokio::test]
    async fn writer_drops_oldest_when_full() {
        let sink = Arc::new(GatedSink { gate: std::sync::Mutex::new(()), inner: MemoryEventLog::new(100) });
        let guard = sink.gate.lock().unwrap();
        let (writer, handle) = EventLogWriter::spawn(sink.clone(), 4);

        // Let the drain task take the first record and block on the gate.
        writer.submit(reading("a", 0, 0.5));
        while writer.pending() > 0 {
            tokio::task::yield_now().await;
        }
        for i in 1..=10 {
            writer.submit(reading("a", i, 0.5));
        }
        assert_eq!(writer.pending(), 4);
        assert_eq!(writer.dropped(), 6);

        drop(guard);
        writer.close();
        handle.await.unwrap();
        let times: Vec<_> = sink.query("a", &TimeRange::all()).unwrap().iter().map(LogRecord::timestamp).collect();
        assert_eq!(times, vec![t(0), t(7), t(8), t(9), t(10)]);
    }
}
