// THEORY:
// A finished EVENT recording can run for an hour. The highlight is the part a
// person actually wants to look at: a short clip centred on the moment the
// visibility score hit its worst, plus a still of that frame and a JSON marker
// describing the event.
//
// Planning is pure arithmetic on timestamps:
// - centre = worst-score time of the event window
// - clip = [centre - before, centre + after], clamped to the recording span
// - offsets into the file = (clip bounds - recording start) x fps, in frames
//
// Writing goes to the blocking pool: the still is a PNG via `image`, the clip is
// cut by a `ClipExtractor` (the binary provides an OpenCV one). The marker is
// always written, even when the clip or still fails, so the event is never lost.
//
// `HighlightGate` enforces a minimum gap between consecutive highlights of one
// camera, so a flapping camera produces one highlight per burst, not one per flap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use image::ImageEncoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RecordingSettings;
use crate::core_modules::event_state::EventWindow;
use crate::core_modules::frame::Frame;
use crate::core_modules::recorder::{RecordingSession, camera_slug};
use crate::error::{Error, Result};

/// Cuts `frame_count` frames starting at `start_frame` from `source` into `output`.
pub trait ClipExtractor: Send + Sync {
    fn extract(&self, request: &ClipRequest) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipRequest {
    pub source: PathBuf,
    pub output: PathBuf,
    pub start_frame: u64,
    pub frame_count: u64,
    pub fps: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HighlightPlan {
    pub camera_id: String,
    pub window: EventWindow,
    pub clip_start: DateTime<Utc>,
    pub clip_end: DateTime<Utc>,
    pub clip: ClipRequest,
    pub marker_path: PathBuf,
    pub still_path: PathBuf,
    pub truncated: bool,
}

/// Sidecar describing one highlight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighlightMarker {
    pub camera_id: String,
    pub recording: PathBuf,
    pub event: EventWindow,
    pub clip_start: DateTime<Utc>,
    pub clip_end: DateTime<Utc>,
    pub start_frame: u64,
    pub frame_count: u64,
    pub clip: Option<PathBuf>,
    pub still: Option<PathBuf>,
    pub recording_truncated: bool,
}

fn secs(value: f64) -> Duration {
    Duration::milliseconds((value * 1_000.0).round() as i64)
}

/// Plans the highlight of `session` for the closed event `window`.
pub fn plan_highlight(session: &RecordingSession, window: &EventWindow, settings: &RecordingSettings, fps: f64) -> HighlightPlan {
    let recording_start = session.started_at;
    let recording_end = session.ended_at.unwrap_or(window.ended_at).max(recording_start);
    let centre = window.worst.at.clamp(recording_start, recording_end);

    let clip_start = (centre - secs(settings.highlight_before_secs)).max(recording_start);
    let clip_end = (centre + secs(settings.highlight_after_secs)).min(recording_end).max(clip_start);

    let to_frames = |d: Duration| ((d.num_milliseconds().max(0) as f64 / 1_000.0) * fps).round() as u64;
    let start_frame = to_frames(clip_start - recording_start);
    let frame_count = to_frames(clip_end - clip_start).max(1);

    let slug = camera_slug(&session.camera_id);
    let stem = format!("{}_{}_highlight", slug, window.worst.at.format("%Y%m%d_%H%M%S_%3f"));
    let dir = settings.highlights_dir.join(&slug);

    HighlightPlan {
        camera_id: session.camera_id.clone(),
        window: *window,
        clip_start,
        clip_end,
        clip: ClipRequest {
            source: session.path.clone(),
            output: dir.join(format!("{stem}.mp4")),
            start_frame,
            frame_count,
            fps,
        },
        marker_path: dir.join(format!("{stem}.json")),
        still_path: dir.join(format!("{stem}.png")),
        truncated: session.truncated,
    }
}

/// Writes an RGB frame as PNG.
pub fn save_still(path: &Path, frame: &Frame) -> Result<()> {
    let output = std::io::BufWriter::new(std::fs::File::create(path)?);
    let encoder = image::codecs::png::PngEncoder::new(output);
    encoder.write_image(frame.as_raw(), frame.width(), frame.height(), image::ExtendedColorType::Rgb8)?;
    Ok(())
}

/// Executes a plan: still, clip, then the marker. Blocking.
pub fn write_highlight(
    plan: &HighlightPlan,
    worst_frame: Option<&Frame>,
    extractor: Option<&dyn ClipExtractor>,
) -> Result<HighlightMarker> {
    if let Some(dir) = plan.marker_path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let still = match worst_frame {
        Some(frame) if !frame.is_empty() => match save_still(&plan.still_path, frame) {
            Ok(()) => Some(plan.still_path.clone()),
            Err(e) => {
                warn!(camera = %plan.camera_id, "highlight still failed: {e}");
                None
            }
        },
        _ => None,
    };

    let clip = match extractor {
        Some(extractor) if plan.clip.source.exists() => match extractor.extract(&plan.clip) {
            Ok(()) => Some(plan.clip.output.clone()),
            Err(e) => {
                warn!(camera = %plan.camera_id, "highlight clip failed: {e}");
                None
            }
        },
        Some(_) => {
            debug!(camera = %plan.camera_id, source = %plan.clip.source.display(), "recording missing, no clip");
            None
        }
        None => None,
    };

    let marker = HighlightMarker {
        camera_id: plan.camera_id.clone(),
        recording: plan.clip.source.clone(),
        event: plan.window,
        clip_start: plan.clip_start,
        clip_end: plan.clip_end,
        start_frame: plan.clip.start_frame,
        frame_count: plan.clip.frame_count,
        clip,
        still,
        recording_truncated: plan.truncated,
    };
    std::fs::write(&plan.marker_path, serde_json::to_vec_pretty(&marker)?)?;
    info!(camera = %plan.camera_id, marker = %plan.marker_path.display(), "highlight written");
    Ok(marker)
}

/// Async wrapper around `write_highlight` on the blocking pool.
pub async fn spawn_highlight(
    plan: HighlightPlan,
    worst_frame: Option<Arc<Frame>>,
    extractor: Option<Arc<dyn ClipExtractor>>,
) -> Result<HighlightMarker> {
    tokio::task::spawn_blocking(move || write_highlight(&plan, worst_frame.as_deref(), extractor.as_deref()))
        .await
        .map_err(|e| Error::Encoder(format!("highlight task failed: {e}")))?
}

/// Minimum spacing between highlights of one camera.
#[derive(Debug, Clone)]
pub struct HighlightGate {
    min_gap: Duration,
    last_end: Option<DateTime<Utc>>,
}

impl HighlightGate {
    pub fn new(min_gap_secs: f64) -> Self {
        HighlightGate { min_gap: secs(min_gap_secs), last_end: None }
    }

    /// True when `window` may produce a highlight; records it if so.
    pub fn admit(&mut self, window: &EventWindow) -> bool {
        if let Some(last) = self.last_end {
            if window.started_at - last < self.min_gap {
                return false;
            }
        }
        self.last_end = Some(window.ended_at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::event_state::ScoreMark;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 8, 30, 0).unwrap() + Duration::seconds(secs)
    }

    fn window(start: i64, worst: i64, end: i64) -> EventWindow {
        EventWindow {
            started_at: t(start),
            ended_at: t(end),
            worst: ScoreMark { score: 0.05, at: t(worst) },
            best: ScoreMark { score: 0.4, at: t(end) },
        }
    }

    fn session(dir: &Path, start: i64, end: i64) -> RecordingSession {
        RecordingSession {
            camera_id: "Harbour Cam #2".into(),
            started_at: t(start),
            path: dir.join("rec.mp4"),
            ended_at: Some(t(end)),
            truncated: false,
            frames_written: 0,
        }
    }

    #[test]
    fn clip_is_centred_on_worst_moment() {
        let settings = RecordingSettings::default();
        let plan = plan_highlight(&session(Path::new("/rec"), 0, 120), &window(0, 60, 120), &settings, 10.0);
        assert_eq!(plan.clip_start, t(50));
        assert_eq!(plan.clip_end, t(70));
        assert_eq!(plan.clip.start_frame, 500);
        assert_eq!(plan.clip.frame_count, 200);
        assert!(plan.marker_path.starts_with(settings.highlights_dir.join("harbour_cam_2")));
    }

    #[test]
    fn clip_is_clamped_to_recording() {
        let settings = RecordingSettings::default();
        let plan = plan_highlight(&session(Path::new("/rec"), 0, 12), &window(0, 3, 12), &settings, 15.0);
        assert_eq!(plan.clip_start, t(0));
        assert_eq!(plan.clip_end, t(12));
        assert_eq!(plan.clip.start_frame, 0);
        assert_eq!(plan.clip.frame_count, 180);
    }

    #[test]
    fn gate_enforces_minimum_gap() {
        let mut gate = HighlightGate::new(10.0);
        assert!(gate.admit(&window(0, 2, 5)));
        assert!(!gate.admit(&window(8, 9, 12)));
        assert!(gate.admit(&window(16, 17, 20)));
    }

    struct RecordingExtractor(Mutex<Vec<ClipRequest>>);

    impl ClipExtractor for RecordingExtractor {
        fn extract(&self, request: &ClipRequest) -> Result<()> {
            self.0.lock().unwrap().push(request.clone());
            std::fs::write(&request.output, b"clip")?;
            Ok(())
        }
    }

    #[test]
    fn writes_marker_still_and_clip() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RecordingSettings { highlights_dir: dir.path().join("hl"), ..RecordingSettings::default() };
        let session = session(dir.path(), 0, 30);
        std::fs::write(&session.path, b"video").unwrap();
        let plan = plan_highlight(&session, &window(0, 15, 30), &settings, 5.0);

        let extractor = RecordingExtractor(Mutex::new(Vec::new()));
        let frame = Frame::uniform(4, 3, [90, 90, 90], t(15));
        let marker = write_highlight(&plan, Some(&frame), Some(&extractor)).unwrap();

        assert_eq!(marker.still.as_deref(), Some(plan.still_path.as_path()));
        assert_eq!(marker.clip.as_deref(), Some(plan.clip.output.as_path()));
        assert_eq!(extractor.0.lock().unwrap().len(), 1);
        let still = image::open(&plan.still_path).unwrap();
        assert_eq!((still.width(), still.height()), (4, 3));

        let written: HighlightMarker = serde_json::from_slice(&std::fs::read(&plan.marker_path).unwrap()).unwrap();
        assert_eq!(written, marker);
    }

    #[test]
    fn marker_written_without_recording_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RecordingSettings { highlights_dir: dir.path().to_path_buf(), ..RecordingSettings::default() };
        let plan = plan_highlight(&session(dir.path(), 0, 30), &window(0, 15, 30), &settings, 5.0);
        let extractor = RecordingExtractor(Mutex::new(Vec::new()));
        let marker = write_highlight(&plan, None, Some(&extractor)).unwrap();
        assert!(marker.clip.is_none());
        assert!(marker.still.is_none());
        assert!(plan.marker_path.exists());
    }
}
