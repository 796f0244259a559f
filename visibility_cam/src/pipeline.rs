// THEORY:
// The `pipeline` module is the per-camera engine. One `CameraPipeline` owns
// everything that belongs to a single camera and nothing that belongs to another:
// its stream, its estimator settings, its event state, its reference-region
// baselines and its recorder. Cameras share only the event-log writer and the
// display bus, both of which are non-blocking fronts.
//
// One tick of the unit:
// 1.  Pull the next frame from the `ReconnectingSource` (or learn it is unavailable).
// 2.  Score it on the blocking pool: visibility sub-metrics inside the ROI, then
//     the reference-region colour deltas.
// 3.  Feed the reading to the hysteresis state machine. A transition starts or
//     stops the recording; the worst frame of the event travels with the stop.
// 4.  Feed the frame to the recorder. A recording runs from the frame that
//     opened the event to the frame that closed it, both included.
// 5.  Append the reading (and any transition or warning) to the event log, and
//     publish the frame, reading and state on the display bus.
//
// `run()` drives ticks at the configured frame rate until the shutdown signal is
// raised, then closes the stream and finalizes the recorder within a grace period.
// The unit never returns an error from its loop: stream failures become
// `Unavailable` ticks, bad frames become `InvalidFrame` ticks, and encoder
// failures are warnings raised by the recorder.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{CameraConfig, RecordingSettings};
use crate::core_modules::display::{DisplayBus, DisplayUpdate};
use crate::core_modules::estimator::{EstimatorConfig, VisibilityEstimator};
use crate::core_modules::event_log::{EventLogWriter, LogRecord, Warning, WarningKind};
use crate::core_modules::event_state::EventStateMachine;
use crate::core_modules::frame::Frame;
use crate::core_modules::frame_source::{NextFrame, ReconnectingSource, StreamBackend};
use crate::core_modules::highlight::ClipExtractor;
use crate::core_modules::recorder::{EncoderFactory, RecorderContext, RecordingController, WarningHandler};
use crate::core_modules::roi::RoiMask;
use crate::core_modules::smart_region::RegionAnalyzer;
use crate::error::Result;

// Re-export the data structures a caller of the unit deals with.
pub use crate::core_modules::estimator::{SubMetrics, VisibilityReading};
pub use crate::core_modules::event_state::{EventState, EventTransition, EventWindow, Mode, VisibilityStatus};
pub use crate::core_modules::recorder::RecordingSession;
pub use crate::core_modules::smart_region::RegionSummary;

/// Collaborators shared by every camera unit of one monitor.
#[derive(Clone)]
pub struct PipelineDeps {
    pub backend: Arc<dyn StreamBackend>,
    pub estimator: EstimatorConfig,
    pub reference_frames: u32,
    pub recording: RecordingSettings,
    /// No factory means no recording, whatever `recording.enabled` says.
    pub encoder: Option<Arc<dyn EncoderFactory>>,
    pub extractor: Option<Arc<dyn ClipExtractor>>,
    pub log: EventLogWriter,
    pub display: DisplayBus,
}

/// Live health of one camera unit, published on a watch channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CameraStatus {
    pub camera_id: String,
    pub connected: bool,
    pub frames_processed: u64,
    pub invalid_frames: u64,
    pub reconnect_sequences: u64,
    pub avg_processing_ms: f64,
    pub mode: Mode,
    pub recording: bool,
    pub last_reading: Option<VisibilityReading>,
}

/// What one tick did.
#[derive(Debug, Clone)]
pub enum TickOutcome {
    Processed { reading: VisibilityReading, transition: Option<EventTransition> },
    InvalidFrame,
    Unavailable,
}

/// Final state of a unit after shutdown.
#[derive(Debug, Clone)]
pub struct UnitSummary {
    pub status: CameraStatus,
    pub recordings: Vec<RecordingSession>,
}

pub struct CameraPipeline {
    config: Arc<CameraConfig>,
    label: Arc<str>,
    source: ReconnectingSource,
    estimator: VisibilityEstimator,
    machine: EventStateMachine,
    /// Moved onto the blocking pool for each frame and handed back.
    regions: Option<RegionAnalyzer>,
    region_template: RegionAnalyzer,
    mask: Option<Arc<RoiMask>>,
    recorder: Option<RecordingController>,
    log: EventLogWriter,
    display: DisplayBus,
    on_warning: WarningHandler,
    status: watch::Sender<CameraStatus>,
    worst: Option<(f64, Arc<Frame>)>,
    region_alert: bool,
    outage_reported: bool,
    processing_total: Duration,
}

/// Fans a warning out to the event log and the display notices.
fn warning_handler(log: EventLogWriter, display: DisplayBus) -> WarningHandler {
    Arc::new(move |warning: Warning| {
        display.notify(warning.clone());
        log.submit(LogRecord::Warning(warning));
    })
}

impl CameraPipeline {
    /// Builds the unit. Must be called inside a tokio runtime when recording is on.
    pub fn new(config: Arc<CameraConfig>, deps: PipelineDeps) -> Result<Self> {
        config.validate()?;
        deps.estimator.validate()?;

        let thresholds = config.thresholds();
        let settings = config.stream_settings.clone();
        let on_warning = warning_handler(deps.log.clone(), deps.display.clone());

        let recorder = match &deps.encoder {
            Some(factory) if deps.recording.enabled => Some(RecordingController::spawn(RecorderContext {
                camera_id: config.id.clone(),
                settings: deps.recording.clone(),
                fps: settings.fps,
                factory: Arc::clone(factory),
                extractor: deps.extractor.clone(),
                frame_buffer: settings.frame_buffer,
                on_warning: Arc::clone(&on_warning),
            })),
            _ => None,
        };
        if recorder.is_none() {
            debug!(camera = %config.id, "recording disabled");
        }

        let regions = RegionAnalyzer::new(&config.regions, config.color_delta_threshold(), deps.reference_frames);
        let (status, _) = watch::channel(CameraStatus { camera_id: config.id.clone(), ..CameraStatus::default() });

        Ok(CameraPipeline {
            label: Arc::from(config.id.as_str()),
            source: ReconnectingSource::new(config.id.clone(), config.stream.clone(), settings, deps.backend),
            estimator: VisibilityEstimator::new(deps.estimator).with_thresholds(thresholds),
            machine: EventStateMachine::new(thresholds),
            regions: Some(regions.clone()),
            region_template: regions,
            mask: None,
            recorder,
            log: deps.log,
            display: deps.display,
            on_warning,
            status,
            worst: None,
            region_alert: false,
            outage_reported: false,
            processing_total: Duration::ZERO,
            config,
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn state(&self) -> &EventState {
        self.machine.state()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.as_ref().is_some_and(RecordingController::is_recording)
    }

    /// Subscribes to status updates.
    pub fn status(&self) -> watch::Receiver<CameraStatus> {
        self.status.subscribe()
    }

    /// Pulls one frame from the stream and processes it.
    pub async fn tick(&mut self) -> TickOutcome {
        match self.source.next_frame().await {
            NextFrame::Ready(frame) => {
                self.outage_reported = false;
                self.process_frame(frame).await
            }
            NextFrame::Unavailable => {
                if !self.outage_reported {
                    self.outage_reported = true;
                    (self.on_warning)(Warning::now(
                        self.config.id.as_str(),
                        WarningKind::StreamUnavailable,
                        format!("stream {} unavailable", self.config.stream),
                    ));
                }
                let sequences = self.source.reconnect_sequences();
                self.status.send_modify(|s| {
                    s.connected = false;
                    s.reconnect_sequences = sequences;
                });
                TickOutcome::Unavailable
            }
        }
    }

    /// Scores one frame and carries the result through state, recorder, log and display.
    pub async fn process_frame(&mut self, frame: Frame) -> TickOutcome {
        let started = Instant::now();
        if let Err(e) = frame.ensure_valid() {
            return self.reject(e.to_string());
        }
        let frame = Arc::new(frame);
        let mask = self.mask_for(&frame);

        let estimator = self.estimator.clone();
        let camera_id = self.config.id.clone();
        let shared = Arc::clone(&frame);
        let mut regions = self.regions.take();
        let measured = tokio::task::spawn_blocking(move || {
            let reading = estimator.estimate_masked(&camera_id, &shared, &mask);
            let summary = match (&reading, regions.as_mut()) {
                (Ok(_), Some(analyzer)) => analyzer.update(&shared),
                _ => None,
            };
            (regions, reading.map(|r| r.with_regions(summary)))
        })
        .await;

        let reading = match measured {
            Ok((regions, Ok(reading))) => {
                self.regions = regions;
                reading
            }
            Ok((regions, Err(e))) => {
                self.regions = regions;
                return self.reject(e.to_string());
            }
            Err(join_error) => {
                // The analyzer went down with the task; start learning again.
                self.regions = Some(self.region_template.clone());
                return self.reject(format!("estimator task failed: {join_error}"));
            }
        };

        let transition = self.machine.observe(&reading);
        self.track_worst(&reading, &frame, transition.as_ref());
        self.check_region_alert(&reading);
        self.log.submit(LogRecord::Reading(reading.clone()));
        match &transition {
            Some(opening) if opening.to == Mode::Event => {
                self.dispatch(opening, &frame);
                self.feed_recorder(&frame);
            }
            Some(closing) => {
                self.feed_recorder(&frame);
                self.dispatch(closing, &frame);
            }
            None => self.feed_recorder(&frame),
        }

        let recording = self.is_recording();
        self.display.publish(DisplayUpdate {
            camera_id: Arc::clone(&self.label),
            frame,
            reading: reading.clone(),
            state: self.machine.state().clone(),
            recording,
        });

        self.processing_total += started.elapsed();
        let total = self.processing_total;
        let connected = self.source.is_connected();
        let sequences = self.source.reconnect_sequences();
        let mode = self.machine.mode();
        self.status.send_modify(|s| {
            s.frames_processed += 1;
            s.avg_processing_ms = total.as_secs_f64() * 1_000.0 / s.frames_processed as f64;
            s.connected = connected;
            s.reconnect_sequences = sequences;
            s.mode = mode;
            s.recording = recording;
            s.last_reading = Some(reading.clone());
        });

        TickOutcome::Processed { reading, transition }
    }

    /// Ticks at the configured frame rate until `shutdown` flips to true or its sender goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, grace: Duration) -> UnitSummary {
        let mut pace = tokio::time::interval(self.config.stream_settings.frame_interval());
        pace.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(camera = %self.config.id, name = self.config.display_name(), stream = %self.config.stream, "camera unit started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = pace.tick() => {}
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.tick() => {}
            }
        }
        self.shutdown(grace).await
    }

    /// Closes the stream and finalizes any recording within `grace`.
    pub async fn shutdown(mut self, grace: Duration) -> UnitSummary {
        self.source.disconnect();
        let recordings = match self.recorder.take() {
            Some(recorder) => recorder.shutdown(grace).await,
            None => Vec::new(),
        };
        self.status.send_modify(|s| {
            s.connected = false;
            s.recording = false;
        });
        let status = self.status.borrow().clone();
        info!(
            camera = %self.config.id,
            frames = status.frames_processed,
            invalid = status.invalid_frames,
            recordings = recordings.len(),
            "camera unit stopped"
        );
        UnitSummary { status, recordings }
    }

    fn mask_for(&mut self, frame: &Frame) -> Arc<RoiMask> {
        let (width, height) = frame.dimensions();
        if let Some(mask) = &self.mask {
            if mask.matches_size(width, height) {
                return Arc::clone(mask);
            }
        }
        debug!(camera = %self.config.id, width, height, "rasterizing region of interest");
        let mask = Arc::new(RoiMask::for_roi(self.config.roi.as_ref(), width, height));
        self.mask = Some(Arc::clone(&mask));
        mask
    }

    fn reject(&mut self, reason: String) -> TickOutcome {
        warn!(camera = %self.config.id, "frame skipped: {reason}");
        (self.on_warning)(Warning::now(self.config.id.as_str(), WarningKind::InvalidFrame, reason));
        self.status.send_modify(|s| s.invalid_frames += 1);
        TickOutcome::InvalidFrame
    }

    /// Keeps the lowest-scoring frame of the current event for the highlight still.
    fn track_worst(&mut self, reading: &VisibilityReading, frame: &Arc<Frame>, transition: Option<&EventTransition>) {
        match transition.map(|t| t.to) {
            Some(Mode::Event) => self.worst = Some((reading.score, Arc::clone(frame))),
            Some(Mode::Normal) => {}
            None if self.machine.mode() == Mode::Event => {
                if self.worst.as_ref().is_none_or(|(score, _)| reading.score < *score) {
                    self.worst = Some((reading.score, Arc::clone(frame)));
                }
            }
            None => {}
        }
    }

    fn check_region_alert(&mut self, reading: &VisibilityReading) {
        let alert = reading.regions.as_ref().and_then(|r| r.alert.as_deref());
        match (alert, self.region_alert) {
            (Some(message), false) => {
                self.region_alert = true;
                warn!(camera = %self.config.id, "reference regions obscured: {message}");
                (self.on_warning)(Warning::now(self.config.id.as_str(), WarningKind::RegionAlert, message));
            }
            (None, true) => {
                self.region_alert = false;
                info!(camera = %self.config.id, "reference regions clear");
            }
            _ => {}
        }
    }

    fn feed_recorder(&self, frame: &Arc<Frame>) {
        if let Some(recorder) = &self.recorder {
            recorder.feed(Arc::clone(frame));
        }
    }

    fn dispatch(&mut self, transition: &EventTransition, frame: &Frame) {
        info!(
            camera = %self.config.id,
            from = ?transition.from,
            to = ?transition.to,
            score = transition.score,
            "visibility mode changed"
        );
        self.log.submit(LogRecord::Transition(transition.clone()));
        let worst = match transition.to {
            Mode::Normal => self.worst.take().map(|(_, frame)| frame),
            Mode::Event => None,
        };
        if let Some(recorder) = &mut self.recorder {
            recorder.handle_transition(transition, frame.dimensions(), worst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StreamSettings, StreamUri};
    use crate::core_modules::event_log::{EventLogSink, MemoryEventLog, TimeRange};
    use crate::core_modules::frame_source::tests::{ScriptedBackend, SharedScript, Step, fast_settings};
    use crate::core_modules::recorder::tests::MockFactory;
    use chrono::Utc;
    use std::sync::atomic::Ordering;
    use tokio::task::JoinHandle;

    const GREY: [u8; 3] = [128, 128, 128];

    struct Harness {
        pipeline: CameraPipeline,
        sink: Arc<MemoryEventLog>,
        log: EventLogWriter,
        log_task: JoinHandle<()>,
        display: DisplayBus,
        factory: Arc<MockFactory>,
        dir: tempfile::TempDir,
    }

    fn harness(script: Vec<Step>, recording: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend::new(script, GREY);
        let factory = Arc::new(MockFactory::default());
        let sink = Arc::new(MemoryEventLog::new(1_000));
        let dyn_sink: Arc<dyn EventLogSink> = sink.clone();
        let (log, log_task) = EventLogWriter::spawn(dyn_sink, 256);
        let display = DisplayBus::new(64);

        let mut camera = CameraConfig::new("quay", StreamUri::Url("rtsp://scripted/quay".into()));
        camera.stream_settings = StreamSettings { fps: 200.0, ..fast_settings() };
        let encoder: Arc<dyn EncoderFactory> = factory.clone();
        let deps = PipelineDeps {
            backend: Arc::new(SharedScript(backend)),
            estimator: EstimatorConfig::default(),
            reference_frames: 2,
            recording: RecordingSettings {
                enabled: recording,
                recordings_dir: dir.path().join("rec"),
                highlights_dir: dir.path().join("hl"),
                min_highlight_gap_secs: 0.0,
                ..RecordingSettings::default()
            },
            encoder: Some(encoder),
            extractor: None,
            log: log.clone(),
            display: display.clone(),
        };
        let pipeline = CameraPipeline::new(Arc::new(camera), deps).unwrap();
        Harness { pipeline, sink, log, log_task, display, factory, dir }
    }

    #[tokio::test]
    async fn readings_transitions_and_recording_flow_through() {
        let script = vec![Step::Crisp, Step::Frame(GREY), Step::Frame(GREY), Step::Crisp, Step::Crisp];
        let mut h = harness(script, true);
        let mut updates = h.display.subscribe();

        let mut modes = Vec::new();
        for _ in 0..5 {
            match h.pipeline.tick().await {
                TickOutcome::Processed { transition: Some(t), .. } => modes.push(t.to),
                TickOutcome::Processed { .. } => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(modes, vec![Mode::Event, Mode::Normal]);

        let summary = h.pipeline.shutdown(Duration::from_secs(2)).await;
        assert_eq!(summary.status.frames_processed, 5);
        assert_eq!(summary.status.mode, Mode::Normal);
        assert_eq!(summary.recordings.len(), 1);
        assert_eq!(h.factory.opens.load(Ordering::SeqCst), 1);

        let mut published = 0;
        while updates.try_recv().is_ok() {
            published += 1;
        }
        assert_eq!(published, 5);

        h.log.close();
        h.log_task.await.unwrap();
        let records = h.sink.query("quay", &TimeRange::all()).unwrap();
        let readings = records.iter().filter(|r| matches!(r, LogRecord::Reading(_))).count();
        let transitions = records.iter().filter(|r| matches!(r, LogRecord::Transition(_))).count();
        assert_eq!((readings, transitions), (5, 2));

        let highlights = std::fs::read_dir(h.dir.path().join("hl").join("quay")).unwrap();
        let stills = highlights
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "png"))
            .count();
        assert_eq!(stills, 1);
    }

    #[tokio::test]
    async fn recording_spans_opening_to_closing_frame() {
        let script = vec![Step::Crisp, Step::Frame(GREY), Step::Frame(GREY), Step::Frame(GREY), Step::Crisp, Step::Crisp];
        let mut h = harness(script, true);
        for _ in 0..6 {
            h.pipeline.tick().await;
        }
        let summary = h.pipeline.shutdown(Duration::from_secs(2)).await;
        assert_eq!(summary.recordings.len(), 1);
        // Three low-visibility frames plus the one that cleared the event.
        assert_eq!(summary.recordings[0].frames_written, 4);
        assert!(!summary.recordings[0].truncated);
    }

    #[tokio::test]
    async fn invalid_frame_is_skipped_without_touching_state() {
        let mut h = harness(Vec::new(), false);
        let mut notices = h.display.subscribe_notices();
        let status = h.pipeline.status();

        let outcome = h.pipeline.process_frame(Frame::uniform(0, 0, GREY, Utc::now())).await;
        assert!(matches!(outcome, TickOutcome::InvalidFrame));
        assert_eq!(h.pipeline.state().mode, Mode::Normal);
        assert_eq!(status.borrow().invalid_frames, 1);
        assert_eq!(status.borrow().frames_processed, 0);
        assert_eq!(notices.recv().await.unwrap().kind, WarningKind::InvalidFrame);
    }

    #[tokio::test]
    async fn disabled_recording_never_opens_an_encoder() {
        let mut h = harness(vec![Step::Frame(GREY), Step::Frame(GREY)], false);
        for _ in 0..2 {
            h.pipeline.tick().await;
        }
        assert_eq!(h.pipeline.state().mode, Mode::Event);
        assert!(!h.pipeline.is_recording());
        let summary = h.pipeline.shutdown(Duration::from_millis(200)).await;
        assert!(summary.recordings.is_empty());
        assert_eq!(h.factory.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_survives_stream_drop_and_stops_on_signal() {
        let script = vec![Step::Crisp, Step::ReadError, Step::OpenError, Step::OpenError, Step::Crisp];
        let h = harness(script, false);
        let mut status = h.pipeline.status();
        let (stop_tx, stop_rx) = watch::channel(false);
        let unit = tokio::spawn(h.pipeline.run(stop_rx, Duration::from_millis(500)));

        let recovered = tokio::time::timeout(Duration::from_secs(5), async {
            status.wait_for(|s| s.reconnect_sequences == 1 && s.frames_processed >= 3).await.is_ok()
        })
        .await;
        assert_eq!(recovered, Ok(true));

        stop_tx.send(true).unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(5), unit).await.unwrap().unwrap();
        assert!(!summary.status.connected);
        assert_eq!(summary.status.reconnect_sequences, 1);
    }
}
