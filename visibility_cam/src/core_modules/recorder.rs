// THEORY:
// The `RecordingController` owns everything that touches video files for one
// camera. It is an actor: a single task that owns the active `RecordingSession`
// and processes `RecorderCommand`s from an unbounded, ordered channel. The camera
// loop only sends commands and never waits on disk or codec.
//
// Key architectural principles:
// 1.  **Single owner**: only the actor opens, writes and finalizes encoders, and it
//     handles one command at a time. A `Start` queued behind a `Stop` runs only
//     after that `Stop` has finalized its file, so a flapping camera can never have
//     two encoders alive or interleave two files.
// 2.  **Frames by feed**: each session gets its own broadcast feed, opened by
//     `start()` and closed by `stop()` on the caller's side. A session therefore
//     holds exactly the frames fed between the two calls, even while the actor is
//     still busy with the previous one. If encoding falls behind, the feed lags
//     and skips frames; the camera loop is never slowed down by the encoder.
// 3.  **Bounded finalize**: once its feed closes, the encode task drains what is
//     buffered and flushes the container. The actor waits `finalize_timeout` for
//     it, then marks the session `truncated` and moves on. A blocking encoder
//     call cannot be cancelled, so the late encoder is kept as `lingering` and
//     the next `Start` waits for it before opening another file.
// 4.  **Failures are warnings**: an encoder that fails to open costs this event its
//     recording, nothing more. Monitoring continues and the warning is reported.
//
// After a session closes, a highlight (clip + still + marker) is planned around
// the worst moment of the event and written in the background.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::RecordingSettings;
use crate::core_modules::event_log::{Warning, WarningKind};
use crate::core_modules::event_state::{EventTransition, EventWindow, Mode};
use crate::core_modules::frame::Frame;
use crate::core_modules::highlight::{ClipExtractor, HighlightGate, plan_highlight, spawn_highlight};
use crate::error::{Error, Result};

/// One open video file.
pub trait VideoEncoder: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flushes and closes the container.
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait EncoderFactory: Send + Sync {
    fn open(&self, path: &Path, params: &EncoderParams) -> Result<Box<dyn VideoEncoder>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderParams {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Receives recording warnings (event log, display notices).
pub type WarningHandler = Arc<dyn Fn(Warning) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSession {
    pub camera_id: String,
    pub started_at: DateTime<Utc>,
    pub path: PathBuf,
    pub ended_at: Option<DateTime<Utc>>,
    pub truncated: bool,
    pub frames_written: u64,
}

/// Lowercase ASCII slug for file names: "Harbour Cam #2" → "harbour_cam_2".
pub fn camera_slug(camera_id: &str) -> String {
    let mut slug = String::with_capacity(camera_id.len());
    for c in camera_id.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    if slug.is_empty() { "camera".to_string() } else { slug.to_string() }
}

/// `<dir>/<slug>/<slug>_<YYYYmmdd_HHMMSS>.mp4`
pub fn recording_path(dir: &Path, camera_id: &str, started_at: DateTime<Utc>) -> PathBuf {
    let slug = camera_slug(camera_id);
    dir.join(&slug).join(format!("{}_{}.mp4", slug, started_at.format("%Y%m%d_%H%M%S")))
}

/// Upper bound for waiting on an encoder that outlived its finalize window.
const LINGER_LIMIT: Duration = Duration::from_secs(10);

enum RecorderCommand {
    Start { started_at: DateTime<Utc>, frame_size: (u32, u32), frames: broadcast::Receiver<Arc<Frame>> },
    Stop { window: EventWindow, worst_frame: Option<Arc<Frame>> },
    Shutdown { grace: Duration, done: oneshot::Sender<()> },
}

/// Collaborators of one camera's recorder.
#[derive(Clone)]
pub struct RecorderContext {
    pub camera_id: String,
    pub settings: RecordingSettings,
    pub fps: f64,
    pub factory: Arc<dyn EncoderFactory>,
    pub extractor: Option<Arc<dyn ClipExtractor>>,
    /// Frames a session may buffer before the oldest are skipped.
    pub frame_buffer: usize,
    pub on_warning: WarningHandler,
}

/// Handle to a camera's recording actor.
pub struct RecordingController {
    commands: mpsc::UnboundedSender<RecorderCommand>,
    feed: Option<broadcast::Sender<Arc<Frame>>>,
    frame_buffer: usize,
    recording: Arc<AtomicBool>,
    sessions: Arc<Mutex<Vec<RecordingSession>>>,
    task: JoinHandle<()>,
}

impl RecordingController {
    pub fn spawn(context: RecorderContext) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let recording = Arc::new(AtomicBool::new(false));
        let sessions = Arc::new(Mutex::new(Vec::new()));
        let frame_buffer = context.frame_buffer.max(1);
        let actor = RecorderActor {
            gate: HighlightGate::new(context.settings.min_highlight_gap_secs),
            context,
            active: None,
            lingering: None,
            last_path: None,
            highlights: JoinSet::new(),
            recording: Arc::clone(&recording),
            sessions: Arc::clone(&sessions),
        };
        let task = tokio::spawn(actor.run(rx));
        RecordingController { commands, feed: None, frame_buffer, recording, sessions, task }
    }

    /// Opens a new session. Frames fed from now on belong to it.
    pub fn start(&mut self, started_at: DateTime<Utc>, frame_size: (u32, u32)) {
        let (feed, frames) = broadcast::channel(self.frame_buffer);
        self.feed = Some(feed);
        self.send(RecorderCommand::Start { started_at, frame_size, frames });
    }

    /// Closes the current session's feed and asks the actor to finalize it.
    pub fn stop(&mut self, window: EventWindow, worst_frame: Option<Arc<Frame>>) {
        self.feed = None;
        self.send(RecorderCommand::Stop { window, worst_frame });
    }

    /// Hands a frame to the open session, if any. Never blocks.
    pub fn feed(&self, frame: Arc<Frame>) {
        if let Some(feed) = &self.feed {
            // Err only means the encoder already went away.
            let _ = feed.send(frame);
        }
    }

    /// Maps a state transition onto start/stop.
    pub fn handle_transition(&mut self, transition: &EventTransition, frame_size: (u32, u32), worst_frame: Option<Arc<Frame>>) {
        match (transition.to, transition.window) {
            (Mode::Event, _) => self.start(transition.at, frame_size),
            (Mode::Normal, Some(window)) => self.stop(window, worst_frame),
            (Mode::Normal, None) => debug!(camera = %transition.camera_id, "closing transition without window"),
        }
    }

    fn send(&self, command: RecorderCommand) {
        if self.commands.send(command).is_err() {
            warn!("recorder actor has stopped; command dropped");
        }
    }

    /// Whether an encode task is currently running.
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Sessions closed so far.
    pub fn sessions(&self) -> Vec<RecordingSession> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Finalizes any active session and waits for pending highlights, within `grace`.
    pub async fn shutdown(mut self, grace: Duration) -> Vec<RecordingSession> {
        self.feed = None;
        let (done, done_rx) = oneshot::channel();
        self.send(RecorderCommand::Shutdown { grace, done });
        let mut task = self.task;
        // The actor may need up to finalize + grace; allow both.
        if tokio::time::timeout(grace * 2, done_rx).await.is_err() {
            warn!("recorder did not shut down in time; aborting");
            task.abort();
        }
        let _ = tokio::time::timeout(grace, &mut task).await;
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct ActiveRecording {
    session: RecordingSession,
    task: JoinHandle<Result<()>>,
    frames_written: Arc<AtomicU64>,
}

struct RecorderActor {
    context: RecorderContext,
    active: Option<ActiveRecording>,
    /// Encode task that missed its finalize window and is still running.
    lingering: Option<JoinHandle<Result<()>>>,
    last_path: Option<PathBuf>,
    gate: HighlightGate,
    highlights: JoinSet<()>,
    recording: Arc<AtomicBool>,
    sessions: Arc<Mutex<Vec<RecordingSession>>>,
}

impl RecorderActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RecorderCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                RecorderCommand::Start { started_at, frame_size, frames } => {
                    self.start(started_at, frame_size, frames).await
                }
                RecorderCommand::Stop { window, worst_frame } => self.stop(window, worst_frame).await,
                RecorderCommand::Shutdown { grace, done } => {
                    self.finalize(Utc::now()).await;
                    if !self.settle(grace).await {
                        warn!(camera = %self.context.camera_id, "encoder still finalizing at shutdown; abandoned");
                    }
                    self.drain_highlights(grace).await;
                    let _ = done.send(());
                    return;
                }
            }
            while let Some(finished) = self.highlights.try_join_next() {
                if let Err(e) = finished {
                    warn!(camera = %self.context.camera_id, "highlight task panicked: {e}");
                }
            }
        }
        // All handles dropped without a shutdown.
        self.finalize(Utc::now()).await;
        self.settle(self.context.settings.finalize_timeout()).await;
    }

    fn warn(&self, kind: WarningKind, message: String) {
        warn!(camera = %self.context.camera_id, ?kind, "{message}");
        (self.context.on_warning)(Warning::now(self.context.camera_id.clone(), kind, message));
    }

    fn allocate_path(&mut self, started_at: DateTime<Utc>) -> PathBuf {
        let base = recording_path(&self.context.settings.recordings_dir, &self.context.camera_id, started_at);
        let mut path = base.clone();
        let mut n = 1;
        while path.exists() || self.last_path.as_ref() == Some(&path) {
            let stem = base.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
            path = base.with_file_name(format!("{stem}_{n}.mp4"));
            n += 1;
        }
        self.last_path = Some(path.clone());
        path
    }

    async fn start(&mut self, started_at: DateTime<Utc>, frame_size: (u32, u32), frames: broadcast::Receiver<Arc<Frame>>) {
        if self.active.is_some() {
            warn!(camera = %self.context.camera_id, "start while recording; closing previous session first");
            self.finalize(started_at).await;
        }

        let path = self.allocate_path(started_at);
        if !self.settle(LINGER_LIMIT).await {
            return self.start_failed(path, "previous recording is still finalizing".into());
        }
        let factory = Arc::clone(&self.context.factory);
        let params = EncoderParams { width: frame_size.0, height: frame_size.1, fps: self.context.fps };
        let open_path = path.clone();
        let opened = tokio::task::spawn_blocking(move || {
            if let Some(parent) = open_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            factory.open(&open_path, &params)
        })
        .await;

        let encoder = match opened {
            Ok(Ok(encoder)) => encoder,
            Ok(Err(e)) => return self.start_failed(path, e.to_string()),
            Err(e) => return self.start_failed(path, e.to_string()),
        };

        let frames_written = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run_encoder(encoder, frames, Arc::clone(&frames_written)));
        info!(camera = %self.context.camera_id, path = %path.display(), "recording started");
        self.active = Some(ActiveRecording {
            session: RecordingSession {
                camera_id: self.context.camera_id.clone(),
                started_at,
                path,
                ended_at: None,
                truncated: false,
                frames_written: 0,
            },
            task,
            frames_written,
        });
        self.recording.store(true, Ordering::Release);
    }

    fn start_failed(&mut self, path: PathBuf, reason: String) {
        let error = Error::EncoderStartFailure { path, reason };
        self.warn(WarningKind::EncoderStartFailure, error.to_string());
        self.recording.store(false, Ordering::Release);
    }

    async fn stop(&mut self, window: EventWindow, worst_frame: Option<Arc<Frame>>) {
        let Some(session) = self.finalize(window.ended_at).await else {
            debug!(camera = %self.context.camera_id, "stop without an active recording");
            return;
        };
        if !self.gate.admit(&window) {
            info!(camera = %self.context.camera_id, "highlight skipped, previous one too recent");
            return;
        }
        let plan = plan_highlight(&session, &window, &self.context.settings, self.context.fps);
        let extractor = self.context.extractor.clone();
        let on_warning = Arc::clone(&self.context.on_warning);
        let camera_id = self.context.camera_id.clone();
        self.highlights.spawn(async move {
            if let Err(e) = spawn_highlight(plan, worst_frame, extractor).await {
                warn!(camera = %camera_id, "highlight failed: {e}");
                on_warning(Warning::now(camera_id, WarningKind::HighlightFailure, e.to_string()));
            }
        });
    }

    /// Stops the active encode task, if any, and records the closed session.
    async fn finalize(&mut self, ended_at: DateTime<Utc>) -> Option<RecordingSession> {
        let ActiveRecording { mut session, mut task, frames_written } = self.active.take()?;
        session.ended_at = Some(ended_at.max(session.started_at));

        let limit = self.context.settings.finalize_timeout();
        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                session.truncated = true;
                self.warn(WarningKind::EncoderError, e.to_string());
            }
            Ok(Err(e)) => {
                session.truncated = true;
                self.warn(WarningKind::EncoderError, format!("encode task failed: {e}"));
            }
            Err(_) => {
                self.lingering = Some(task);
                session.truncated = true;
                let error = Error::EncoderFinalizeTimeout { path: session.path.clone(), timeout: limit };
                self.warn(WarningKind::EncoderFinalizeTimeout, error.to_string());
            }
        }
        session.frames_written = frames_written.load(Ordering::Acquire);
        self.recording.store(false, Ordering::Release);
        info!(
            camera = %self.context.camera_id,
            path = %session.path.display(),
            frames = session.frames_written,
            truncated = session.truncated,
            "recording closed"
        );
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).push(session.clone());
        Some(session)
    }

    /// Waits up to `limit` for a lingering encoder. False if it is still running.
    async fn settle(&mut self, limit: Duration) -> bool {
        let Some(mut task) = self.lingering.take() else {
            return true;
        };
        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                debug!(camera = %self.context.camera_id, "late encoder ended with an error: {e}");
                true
            }
            Ok(Err(e)) => {
                debug!(camera = %self.context.camera_id, "late encode task failed: {e}");
                true
            }
            Err(_) => {
                self.lingering = Some(task);
                false
            }
        }
    }

    async fn drain_highlights(&mut self, grace: Duration) {
        let drained = tokio::time::timeout(grace, async {
            while self.highlights.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(camera = %self.context.camera_id, "pending highlights abandoned at shutdown");
            self.highlights.abort_all();
        }
    }
}

async fn write_one(mut encoder: Box<dyn VideoEncoder>, frame: Arc<Frame>) -> Result<Box<dyn VideoEncoder>> {
    tokio::task::spawn_blocking(move || {
        encoder.write_frame(&frame)?;
        Ok::<_, Error>(encoder)
    })
    .await
    .map_err(|e| Error::Encoder(format!("write task failed: {e}")))?
}

/// Writes fed frames until the feed closes, then finishes the file.
async fn run_encoder(
    mut encoder: Box<dyn VideoEncoder>,
    mut frames: broadcast::Receiver<Arc<Frame>>,
    written: Arc<AtomicU64>,
) -> Result<()> {
    loop {
        match frames.recv().await {
            Ok(frame) => {
                encoder = write_one(encoder, frame).await?;
                written.fetch_add(1, Ordering::AcqRel);
            }
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "encoder lagging, frames skipped"),
            Err(RecvError::Closed) => break,
        }
    }
    tokio::task::spawn_blocking(move || encoder.finish())
        .await
        .map_err(|e| Error::Encoder(format!("finish task failed: {e}")))?
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core_modules::event_state::ScoreMark;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    /// Counts open encoders and remembers the highest concurrency seen.
    #[derive(Default)]
    pub struct MockFactory {
        pub opens: AtomicUsize,
        pub live: Arc<AtomicUsize>,
        pub max_live: Arc<AtomicUsize>,
        pub fail_open: AtomicBool,
        pub finish_delay_ms: AtomicU64,
        pub paths: Mutex<Vec<PathBuf>>,
    }

    struct MockEncoder {
        live: Arc<AtomicUsize>,
        finish_delay: Duration,
    }

    impl VideoEncoder for MockEncoder {
        fn write_frame(&mut self, _frame: &Frame) -> Result<()> {
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<()> {
            std::thread::sleep(self.finish_delay);
            Ok(())
        }
    }

    impl Drop for MockEncoder {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl EncoderFactory for MockFactory {
        fn open(&self, path: &Path, _params: &EncoderParams) -> Result<Box<dyn VideoEncoder>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(Error::Encoder("codec unavailable".into()));
            }
            self.paths.lock().unwrap().push(path.to_path_buf());
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(Box::new(MockEncoder {
                live: Arc::clone(&self.live),
                finish_delay: Duration::from_millis(self.finish_delay_ms.load(Ordering::SeqCst)),
            }))
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 3, 5, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn window(start: i64, end: i64) -> EventWindow {
        EventWindow {
            started_at: t(start),
            ended_at: t(end),
            worst: ScoreMark { score: 0.1, at: t(start) },
            best: ScoreMark { score: 0.6, at: t(end) },
        }
    }

    struct Harness {
        controller: RecordingController,
        warnings: Arc<Mutex<Vec<Warning>>>,
        _dir: tempfile::TempDir,
    }

    fn harness(factory: Arc<MockFactory>, finalize_timeout_ms: u64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&warnings);
        let context = RecorderContext {
            camera_id: "Pier 4".into(),
            settings: RecordingSettings {
                recordings_dir: dir.path().join("rec"),
                highlights_dir: dir.path().join("hl"),
                finalize_timeout_ms,
                min_highlight_gap_secs: 0.0,
                ..RecordingSettings::default()
            },
            fps: 10.0,
            factory,
            extractor: None,
            frame_buffer: 16,
            on_warning: Arc::new(move |w| sink.lock().unwrap().push(w)),
        };
        Harness { controller: RecordingController::spawn(context), warnings, _dir: dir }
    }

    #[test]
    fn slug_and_path() {
        assert_eq!(camera_slug("Harbour Cam #2"), "harbour_cam_2");
        assert_eq!(camera_slug("--"), "camera");
        let path = recording_path(Path::new("/data"), "Pier 4", t(0));
        assert_eq!(path, PathBuf::from("/data/pier_4/pier_4_20250203_050000.mp4"));
    }

    #[tokio::test]
    async fn flapping_never_overlaps_encoders() {
        let factory = Arc::new(MockFactory::default());
        factory.finish_delay_ms.store(20, Ordering::SeqCst);
        let mut h = harness(Arc::clone(&factory), 1_000);

        for i in 0..5 {
            let start = i * 10;
            h.controller.start(t(start), (8, 8));
            h.controller.stop(window(start, start + 5), None);
        }
        let sessions = h.controller.shutdown(Duration::from_secs(2)).await;

        assert_eq!(factory.opens.load(Ordering::SeqCst), 5);
        assert_eq!(factory.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(factory.live.load(Ordering::SeqCst), 0);
        assert_eq!(sessions.len(), 5);
        assert!(sessions.iter().all(|s| !s.truncated));
        let mut paths = factory.paths.lock().unwrap().clone();
        paths.dedup();
        assert_eq!(paths.len(), 5);
    }

    #[tokio::test]
    async fn late_encoder_blocks_the_next_open() {
        let factory = Arc::new(MockFactory::default());
        factory.finish_delay_ms.store(200, Ordering::SeqCst);
        let mut h = harness(Arc::clone(&factory), 30);

        for i in 0..2 {
            let start = i * 10;
            h.controller.start(t(start), (8, 8));
            h.controller.feed(Arc::new(Frame::uniform(8, 8, [9, 9, 9], t(start))));
            h.controller.stop(window(start, start + 5), None);
        }
        let sessions = h.controller.shutdown(Duration::from_secs(2)).await;

        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
        assert_eq!(factory.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(factory.live.load(Ordering::SeqCst), 0);
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.truncated));
        let kinds: Vec<_> = h.warnings.lock().unwrap().iter().map(|w| w.kind).collect();
        assert_eq!(kinds, vec![WarningKind::EncoderFinalizeTimeout; 2]);
    }

    #[tokio::test]
    async fn writes_fed_frames_until_stopped() {
        let factory = Arc::new(MockFactory::default());
        let mut h = harness(Arc::clone(&factory), 1_000);
        // Nothing is open yet; this frame goes nowhere.
        h.controller.feed(Arc::new(Frame::uniform(4, 4, [0, 0, 0], t(0))));
        h.controller.start(t(0), (4, 4));
        for _ in 0..3 {
            h.controller.feed(Arc::new(Frame::uniform(4, 4, [1, 2, 3], t(1))));
        }
        h.controller.stop(window(0, 2), None);
        h.controller.feed(Arc::new(Frame::uniform(4, 4, [0, 0, 0], t(3))));
        let sessions = h.controller.shutdown(Duration::from_secs(2)).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].frames_written, 3);
        assert_eq!(sessions[0].ended_at, Some(t(2)));
        assert!(sessions[0].path.ends_with("pier_4/pier_4_20250203_050000.mp4"));
    }

    #[tokio::test]
    async fn open_failure_is_a_warning() {
        let factory = Arc::new(MockFactory::default());
        factory.fail_open.store(true, Ordering::SeqCst);
        let mut h = harness(Arc::clone(&factory), 1_000);
        h.controller.start(t(0), (4, 4));
        h.controller.stop(window(0, 3), None);
        let sessions = h.controller.shutdown(Duration::from_secs(1)).await;

        assert!(sessions.is_empty());
        let warnings = h.warnings.lock().unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::EncoderStartFailure);
        assert_eq!(warnings[0].camera_id, "Pier 4");
    }

    #[tokio::test]
    async fn slow_finalize_is_truncated() {
        let factory = Arc::new(MockFactory::default());
        factory.finish_delay_ms.store(300, Ordering::SeqCst);
        let mut h = harness(Arc::clone(&factory), 30);
        h.controller.start(t(0), (4, 4));
        h.controller.stop(window(0, 3), None);
        let sessions = h.controller.shutdown(Duration::from_secs(1)).await;

        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].truncated);
        let kinds: Vec<_> = h.warnings.lock().unwrap().iter().map(|w| w.kind).collect();
        assert_eq!(kinds, vec![WarningKind::EncoderFinalizeTimeout]);
    }

    #[tokio::test]
    async fn stop_writes_highlight_marker() {
        let factory = Arc::new(MockFactory::default());
        let mut h = harness(Arc::clone(&factory), 1_000);
        h.controller.start(t(0), (4, 4));
        let worst = Arc::new(Frame::uniform(4, 4, [50, 50, 50], t(0)));
        h.controller.stop(window(0, 30), Some(worst));
        h.controller.shutdown(Duration::from_secs(2)).await;

        let marker_dir = h._dir.path().join("hl").join("pier_4");
        let entries: Vec<_> = std::fs::read_dir(&marker_dir).unwrap().map(|e| e.unwrap().path()).collect();
        assert!(entries.iter().any(|p| p.extension().is_some_and(|e| e == "json")));
        assert!(entries.iter().any(|p| p.extension().is_some_and(|e| e == "png")));
    }
}
