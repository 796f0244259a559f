// THEORY:
// A `SmartRegion` watches one named landmark in the scene (a tower at 800 m, a
// hillside at 2 km) and answers a single question per frame: how far has its
// colour drifted from what it looks like on a clear day?
//
// Like a `SmartChunk`, it is stateful and learns before it judges:
// 1.  **Learning**: for the first `reference_frames` frames it folds the region's
//     mean CIELAB colour into a running-mean baseline. No verdict is produced.
// 2.  **Judging**: afterwards every frame yields a ΔE (CIE76) against that baseline.
//     A region whose ΔE exceeds the camera's colour-delta threshold is "obscured".
//
// The `RegionAnalyzer` owns all regions of one camera and aggregates them into a
// `RegionSummary`: the average ΔE, a visibility distance estimate and an optional
// alert. The distance estimate sits between the farthest landmark still clear and
// the nearest one already obscured; with only one side present it is stretched
// (x1.2, all clear) or shrunk (x0.8, all obscured) from the extreme landmark.

use serde::{Deserialize, Serialize};

use crate::core_modules::frame::Frame;
use crate::core_modules::pixel::pixel::Lab;
use crate::core_modules::roi::Roi;
use crate::error::{Error, Result};

pub const DEFAULT_REFERENCE_FRAMES: u32 = 10;
pub const DEFAULT_REGION_DISTANCE_M: f64 = 100.0;
/// Average ΔE above `threshold * ALERT_FACTOR` raises an alert.
pub const ALERT_FACTOR: f64 = 1.5;

fn default_distance() -> f64 {
    DEFAULT_REGION_DISTANCE_M
}

/// A named landmark in normalized coordinates with its distance from the camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRegion {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default = "default_distance")]
    pub distance_m: f64,
}

impl ReferenceRegion {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("reference region name must not be empty"));
        }
        self.as_roi()
            .validate()
            .map_err(|e| Error::config(format!("region {}: {}", self.name, e)))?;
        if !self.distance_m.is_finite() || self.distance_m <= 0.0 {
            return Err(Error::config(format!("region {}: distance must be positive", self.name)));
        }
        Ok(())
    }

    pub fn as_roi(&self) -> Roi {
        Roi::Rect { x: self.x, y: self.y, width: self.width, height: self.height }
    }

    /// Pixel bounds `(x0, y0, x1, y1)`, exclusive end, for a frame size. At least one pixel.
    fn pixel_bounds(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let to_px = |v: f64, len: u32| ((v * len as f64).round() as u32).min(len);
        let x0 = to_px(self.x, width).min(width.saturating_sub(1));
        let y0 = to_px(self.y, height).min(height.saturating_sub(1));
        let x1 = to_px(self.x + self.width, width).max(x0 + 1).min(width);
        let y1 = to_px(self.y + self.height, height).max(y0 + 1).min(height);
        (x0, y0, x1, y1)
    }

    /// Mean CIELAB colour of the region in `frame`.
    pub fn mean_lab(&self, frame: &Frame) -> Option<Lab> {
        if frame.is_empty() {
            return None;
        }
        let (x0, y0, x1, y1) = self.pixel_bounds(frame.width(), frame.height());
        let mut sum = Lab::default();
        let mut count = 0u64;
        for y in y0..y1 {
            for x in x0..x1 {
                let lab = frame.pixel(x, y).to_lab();
                sum.l += lab.l;
                sum.a += lab.a;
                sum.b += lab.b;
                count += 1;
            }
        }
        if count == 0 {
            return None;
        }
        let n = count as f64;
        Some(Lab { l: sum.l / n, a: sum.a / n, b: sum.b / n })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDelta {
    pub name: String,
    pub distance_m: f64,
    pub delta_e: f64,
    pub obscured: bool,
}

/// Per-frame region diagnostics attached to a reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSummary {
    pub regions: Vec<RegionDelta>,
    pub color_delta_avg: f64,
    pub visibility_distance_m: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
}

/// Stateful baseline tracker for one reference region.
#[derive(Debug, Clone)]
pub struct SmartRegion {
    region: ReferenceRegion,
    baseline: Option<Lab>,
    frames_learned: u32,
    reference_frames: u32,
}

impl SmartRegion {
    pub fn new(region: ReferenceRegion, reference_frames: u32) -> Self {
        SmartRegion { region, baseline: None, frames_learned: 0, reference_frames: reference_frames.max(1) }
    }

    pub fn region(&self) -> &ReferenceRegion {
        &self.region
    }

    pub fn is_learning(&self) -> bool {
        self.frames_learned < self.reference_frames
    }

    /// Feeds one frame. Returns the ΔE once the baseline is learned.
    pub fn update(&mut self, frame: &Frame) -> Option<f64> {
        let lab = self.region.mean_lab(frame)?;
        if self.is_learning() {
            self.frames_learned += 1;
            let weight = 1.0 / self.frames_learned as f64;
            self.baseline = Some(match self.baseline {
                Some(base) => base.blend(&lab, weight),
                None => lab,
            });
            return None;
        }
        self.baseline.map(|base| base.delta_e(&lab))
    }

    pub fn reset(&mut self) {
        self.baseline = None;
        self.frames_learned = 0;
    }
}

/// Owns every `SmartRegion` of one camera.
#[derive(Debug, Clone)]
pub struct RegionAnalyzer {
    regions: Vec<SmartRegion>,
    threshold: f64,
}

impl RegionAnalyzer {
    pub fn new(regions: &[ReferenceRegion], color_delta_threshold: f64, reference_frames: u32) -> Self {
        RegionAnalyzer {
            regions: regions.iter().cloned().map(|r| SmartRegion::new(r, reference_frames)).collect(),
            threshold: color_delta_threshold,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Updates every region; `None` while any baseline is still learning or no regions exist.
    pub fn update(&mut self, frame: &Frame) -> Option<RegionSummary> {
        if self.regions.is_empty() {
            return None;
        }
        let mut deltas = Vec::with_capacity(self.regions.len());
        let mut complete = true;
        for smart in &mut self.regions {
            match smart.update(frame) {
                Some(delta_e) => deltas.push(RegionDelta {
                    name: smart.region().name.clone(),
                    distance_m: smart.region().distance_m,
                    delta_e,
                    obscured: delta_e > self.threshold,
                }),
                None => complete = false,
            }
        }
        if !complete || deltas.is_empty() {
            return None;
        }

        let color_delta_avg = deltas.iter().map(|d| d.delta_e).sum::<f64>() / deltas.len() as f64;
        let clear: Vec<f64> = deltas.iter().filter(|d| !d.obscured).map(|d| d.distance_m).collect();
        let obscured: Vec<f64> = deltas.iter().filter(|d| d.obscured).map(|d| d.distance_m).collect();
        let alert = (color_delta_avg > self.threshold * ALERT_FACTOR).then(|| {
            format!(
                "average colour delta {:.1} exceeds {:.1}",
                color_delta_avg,
                self.threshold * ALERT_FACTOR
            )
        });

        Some(RegionSummary {
            regions: deltas,
            color_delta_avg,
            visibility_distance_m: estimate_visibility_distance(&clear, &obscured),
            alert,
        })
    }

    /// Forgets every baseline, e.g. after the camera was moved.
    pub fn reset(&mut self) {
        self.regions.iter_mut().for_each(SmartRegion::reset);
    }
}

/// Distance estimate from the distances of clear and obscured landmarks.
pub fn estimate_visibility_distance(clear: &[f64], obscured: &[f64]) -> Option<f64> {
    let farthest_clear = clear.iter().copied().reduce(f64::max);
    let nearest_obscured = obscured.iter().copied().reduce(f64::min);
    match (farthest_clear, nearest_obscured) {
        (Some(c), Some(o)) => Some((c + o) / 2.0),
        (Some(c), None) => Some(c * 1.2),
        (None, Some(o)) => Some(o * 0.8),
        (None, None) => None,
    }
}
