// THEORY:
// The `ParallelPipeline` runs every configured camera at once. Each camera gets
// its own `CameraPipeline` on its own tokio task; the units share nothing but the
// event-log writer, the display bus and a shutdown signal. One camera's stream
// stalling, its encoder failing, or even its task panicking has no effect on the
// others: a panic is caught at the task boundary, logged, and that camera simply
// stops reporting.
//
// Shutdown is cooperative. Raising the watch flag makes every unit leave its loop,
// close its stream and finalize its recording. The supervisor waits for all of
// them under an overall limit, aborts stragglers, then drains the event log.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, warn};

use crate::config::{AppConfig, EventLogSettings};
use crate::core_modules::display::DisplayBus;
use crate::core_modules::event_log::{
    EventLogSink, EventLogWriter, JsonlEventLog, LogSummary, MemoryEventLog, TimeRange, summarize,
};
use crate::core_modules::frame_source::StreamBackend;
use crate::core_modules::highlight::ClipExtractor;
use crate::core_modules::recorder::EncoderFactory;
use crate::core_modules::smart_region::DEFAULT_REFERENCE_FRAMES;
use crate::error::{Error, Result};
use crate::pipeline::{CameraPipeline, CameraStatus, PipelineDeps, UnitSummary};

const DISPLAY_CAPACITY: usize = 32;

/// Platform pieces the binary plugs in.
#[derive(Clone)]
pub struct MonitorDeps {
    pub backend: Arc<dyn StreamBackend>,
    pub encoder: Option<Arc<dyn EncoderFactory>>,
    pub extractor: Option<Arc<dyn ClipExtractor>>,
}

/// The configured sink: a JSON-lines file, or memory when no path is set.
pub fn open_sink(settings: &EventLogSettings) -> Result<Arc<dyn EventLogSink>> {
    match &settings.path {
        Some(path) => Ok(Arc::new(JsonlEventLog::open(path.clone())?)),
        None => Ok(Arc::new(MemoryEventLog::new(settings.memory_capacity))),
    }
}

struct Unit {
    camera_id: String,
    status: watch::Receiver<CameraStatus>,
    abort: AbortHandle,
    task: JoinHandle<Option<UnitSummary>>,
}

pub struct ParallelPipeline {
    units: Vec<Unit>,
    shutdown_tx: watch::Sender<bool>,
    log: EventLogWriter,
    log_task: JoinHandle<()>,
    sink: Arc<dyn EventLogSink>,
    display: DisplayBus,
    grace: Duration,
}

impl ParallelPipeline {
    /// Validates `config` and starts one unit per camera. Must be called inside a tokio runtime.
    pub fn start(config: &AppConfig, deps: MonitorDeps, sink: Arc<dyn EventLogSink>) -> Result<Self> {
        config.validate()?;
        if config.cameras.is_empty() {
            return Err(Error::config("no cameras configured"));
        }

        let (log, log_task) = EventLogWriter::spawn(Arc::clone(&sink), config.event_log.queue_capacity);
        let display = DisplayBus::new(DISPLAY_CAPACITY);
        let shared = PipelineDeps {
            backend: deps.backend,
            estimator: config.estimator.clone(),
            reference_frames: match config.reference_frames {
                0 => DEFAULT_REFERENCE_FRAMES,
                n => n,
            },
            recording: config.recording.clone(),
            encoder: deps.encoder,
            extractor: deps.extractor,
            log: log.clone(),
            display: display.clone(),
        };

        let pipelines = config
            .cameras
            .values()
            .map(|camera| CameraPipeline::new(Arc::new(camera.clone()), shared.clone()))
            .collect::<Result<Vec<_>>>();
        let pipelines = match pipelines {
            Ok(pipelines) => pipelines,
            Err(e) => {
                log.close();
                return Err(e);
            }
        };

        let grace = config.recording.finalize_timeout();
        let (shutdown_tx, _) = watch::channel(false);
        let units = pipelines
            .into_iter()
            .map(|pipeline| {
                let camera_id = pipeline.camera_id().to_string();
                let status = pipeline.status();
                let inner = tokio::spawn(pipeline.run(shutdown_tx.subscribe(), grace));
                let abort = inner.abort_handle();
                let id = camera_id.clone();
                let task = tokio::spawn(async move {
                    match inner.await {
                        Ok(summary) => Some(summary),
                        Err(e) if e.is_panic() => {
                            error!(camera = %id, "camera unit panicked: {e}");
                            None
                        }
                        Err(e) => {
                            warn!(camera = %id, "camera unit cancelled: {e}");
                            None
                        }
                    }
                });
                Unit { camera_id, status, abort, task }
            })
            .collect::<Vec<_>>();

        info!(cameras = units.len(), "monitor started");
        Ok(ParallelPipeline { units, shutdown_tx, log, log_task, sink, display, grace })
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|u| u.camera_id.as_str())
    }

    pub fn display(&self) -> &DisplayBus {
        &self.display
    }

    pub fn log(&self) -> &EventLogWriter {
        &self.log
    }

    pub fn sink(&self) -> Arc<dyn EventLogSink> {
        Arc::clone(&self.sink)
    }

    /// Latest status of one camera.
    pub fn status(&self, camera_id: &str) -> Option<CameraStatus> {
        self.units.iter().find(|u| u.camera_id == camera_id).map(|u| u.status.borrow().clone())
    }

    pub fn statuses(&self) -> BTreeMap<String, CameraStatus> {
        self.units.iter().map(|u| (u.camera_id.clone(), u.status.borrow().clone())).collect()
    }

    /// Whether the camera's task is still alive.
    pub fn is_running(&self, camera_id: &str) -> bool {
        self.units.iter().any(|u| u.camera_id == camera_id && !u.task.is_finished())
    }

    /// Aggregates what the log holds for `camera_id` in `range`.
    pub fn summarize(&self, camera_id: &str, range: &TimeRange) -> Result<LogSummary> {
        summarize(self.sink.as_ref(), camera_id, range)
    }

    /// Stops every unit, then drains the event log.
    pub async fn shutdown(self) -> Vec<UnitSummary> {
        info!(cameras = self.units.len(), "monitor shutting down");
        // Err only means every unit is already gone.
        let _ = self.shutdown_tx.send(true);

        // A unit may spend one read timeout in flight plus the recorder's grace twice.
        let limit = self.grace * 3 + Duration::from_secs(1);
        let aborts: Vec<(String, AbortHandle)> =
            self.units.iter().map(|u| (u.camera_id.clone(), u.abort.clone())).collect();
        let handles = self.units.into_iter().map(|u| u.task);

        let summaries = match tokio::time::timeout(limit, join_all(handles)).await {
            Ok(results) => results.into_iter().filter_map(|r| r.ok().flatten()).collect(),
            Err(_) => {
                for (camera_id, abort) in aborts {
                    if !abort.is_finished() {
                        error!(camera = %camera_id, "camera unit did not stop in time; aborting");
                        abort.abort();
                    }
                }
                Vec::new()
            }
        };

        self.log.close();
        if tokio::time::timeout(self.grace, self.log_task).await.is_err() {
            warn!(pending = self.log.pending(), "event log did not drain in time");
        }
        if self.log.dropped() > 0 {
            warn!(dropped = self.log.dropped(), "event log records were dropped under load");
        }
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, StreamSettings, StreamUri};
    use crate::core_modules::frame_source::StreamConnection;
    use crate::core_modules::frame_source::tests::{ScriptedBackend, SharedScript, fast_settings};

    /// Serves the scripted stream, except for URLs naming a broken camera, whose open panics.
    struct Routed {
        healthy: SharedScript,
    }

    impl StreamBackend for Routed {
        fn open(&self, uri: &StreamUri, settings: &StreamSettings) -> Result<Box<dyn StreamConnection>> {
            match uri {
                StreamUri::Url(url) if url.contains("broken") => panic!("decoder crashed"),
                _ => self.healthy.open(uri, settings),
            }
        }
    }

    fn camera(id: &str, url: &str) -> CameraConfig {
        let mut camera = CameraConfig::new(id, StreamUri::Url(url.into()));
        camera.stream_settings = StreamSettings { fps: 200.0, ..fast_settings() };
        camera
    }

    fn config(cameras: Vec<CameraConfig>) -> AppConfig {
        AppConfig {
            cameras: cameras.into_iter().map(|c| (c.id.clone(), c)).collect(),
            ..AppConfig::default()
        }
    }

    fn deps() -> MonitorDeps {
        let backend = ScriptedBackend::new(Vec::new(), [120, 120, 120]);
        MonitorDeps {
            backend: Arc::new(Routed { healthy: SharedScript(backend) }),
            encoder: None,
            extractor: None,
        }
    }

    #[tokio::test]
    async fn failing_camera_does_not_affect_its_sibling() {
        let config = config(vec![camera("quay", "rtsp://cam/quay"), camera("mast", "rtsp://cam/broken")]);
        let sink: Arc<dyn EventLogSink> = Arc::new(MemoryEventLog::new(10_000));
        let monitor = ParallelPipeline::start(&config, deps(), sink).unwrap();
        assert_eq!(monitor.camera_ids().collect::<Vec<_>>(), vec!["mast", "quay"]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let quay = monitor.status("quay").unwrap();
        let mast = monitor.status("mast").unwrap();
        assert!(quay.frames_processed > 0);
        assert_eq!(mast.frames_processed, 0);
        assert!(!mast.connected);
        assert!(monitor.is_running("mast"));

        let sink = monitor.sink();
        let summaries = monitor.shutdown().await;
        assert_eq!(summaries.len(), 2);

        let summary = summarize(sink.as_ref(), "quay", &TimeRange::all()).unwrap();
        assert!(summary.readings > 0);
        assert!(summary.events >= 1);
        let outages = summarize(sink.as_ref(), "mast", &TimeRange::all()).unwrap();
        assert_eq!(outages.readings, 0);
        assert!(outages.warnings >= 1);
    }

    #[tokio::test]
    async fn empty_configuration_is_rejected() {
        let sink: Arc<dyn EventLogSink> = Arc::new(MemoryEventLog::default());
        let result = ParallelPipeline::start(&AppConfig::default(), deps(), sink);
        assert!(matches!(result, Err(Error::ConfigValidation(_))));
    }

    #[tokio::test]
    async fn invalid_camera_is_rejected_before_anything_starts() {
        let mut bad = camera("quay", "rtsp://cam/quay");
        bad.recovery_threshold = bad.trigger_threshold;
        let sink: Arc<dyn EventLogSink> = Arc::new(MemoryEventLog::default());
        assert!(ParallelPipeline::start(&config(vec![bad]), deps(), sink).is_err());
    }

    #[test]
    fn memory_sink_when_no_path() {
        let settings = EventLogSettings { path: None, ..EventLogSettings::default() };
        let sink = open_sink(&settings).unwrap();
        assert!(sink.query("any", &TimeRange::all()).unwrap().is_empty());
    }
}
