// THEORY:
// The `VisibilityEstimator` turns one frame into one number: a visibility score in
// [0, 1] where 1 is a crisp, colourful scene and 0 is a flat grey wall of fog.
// It is a pure function of (frame, ROI, config). No history, no I/O, so the same
// input always gives the same score and the estimator can run on any thread.
//
// Fog and haze attack an image in three measurable ways, one sub-metric each:
//
// 1.  **Contrast**: scattered light lifts the shadows and dims the highlights, so
//     the luminance distribution narrows. Measured as the standard deviation of
//     Rec. 601 luminance over the ROI, divided by 128 (the std-dev of a pure
//     black/white split).
// 2.  **Edge density**: distant structure dissolves first. Measured as the share
//     of ROI pixels whose 3x3 Sobel gradient magnitude exceeds a threshold, scaled
//     by a reference share that a clear scene typically reaches.
// 3.  **Colour variance**: haze is achromatic. Measured as the mean per-pixel
//     standard deviation across R,G,B, scaled by a reference.
//
// The score is the weighted average of the three normalized sub-metrics, clamped
// to [0, 1]. Anything non-finite collapses to 0, the most conservative reading.
// Brightness (mean luminance) rides along as a diagnostic but is not scored:
// dusk is dark, not foggy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_modules::event_state::{Thresholds, VisibilityStatus};
use crate::core_modules::frame::Frame;
use crate::core_modules::pixel::pixel::{CHANNELS, Pixel};
use crate::core_modules::roi::{Roi, RoiMask};
use crate::core_modules::smart_region::RegionSummary;
use crate::error::{Error, Result};

/// Relative weight of each sub-metric in the final score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorWeights {
    pub contrast: f64,
    pub edge_density: f64,
    pub color_variance: f64,
}

impl Default for EstimatorWeights {
    fn default() -> Self {
        EstimatorWeights { contrast: 0.40, edge_density: 0.35, color_variance: 0.25 }
    }
}

impl EstimatorWeights {
    pub fn sum(&self) -> f64 {
        self.contrast + self.edge_density + self.color_variance
    }
}

/// Tunable constants of the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub weights: EstimatorWeights,
    /// Sobel magnitude above which a pixel counts as an edge.
    pub edge_magnitude_threshold: f64,
    /// Edge share that maps to a full edge score.
    pub edge_density_reference: f64,
    /// Luminance std-dev that maps to a full contrast score.
    pub contrast_reference: f64,
    /// Mean channel std-dev that maps to a full colour score.
    pub color_variance_reference: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            weights: EstimatorWeights::default(),
            edge_magnitude_threshold: 96.0,
            edge_density_reference: 0.10,
            contrast_reference: 128.0,
            color_variance_reference: 32.0,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        let w = &self.weights;
        for (name, value) in [
            ("contrast", w.contrast),
            ("edge_density", w.edge_density),
            ("color_variance", w.color_variance),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::config(format!("estimator weight {name} must be a non-negative number")));
            }
        }
        if w.sum() <= 0.0 {
            return Err(Error::config("estimator weights must have a positive sum"));
        }
        for (name, value) in [
            ("edge_magnitude_threshold", self.edge_magnitude_threshold),
            ("edge_density_reference", self.edge_density_reference),
            ("contrast_reference", self.contrast_reference),
            ("color_variance_reference", self.color_variance_reference),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::config(format!("estimator {name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Normalized sub-metrics (0..1) plus the brightness diagnostic (0..255).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SubMetrics {
    pub contrast: f64,
    pub edge_density: f64,
    pub color_variance: f64,
    pub brightness: f64,
}

/// One scored frame. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibilityReading {
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    pub score: f64,
    pub metrics: SubMetrics,
    pub status: VisibilityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regions: Option<RegionSummary>,
}

impl VisibilityReading {
    pub fn with_regions(mut self, regions: Option<RegionSummary>) -> Self {
        self.regions = regions;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct VisibilityEstimator {
    config: EstimatorConfig,
    thresholds: Thresholds,
}

impl VisibilityEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        VisibilityEstimator { config, thresholds: Thresholds::default() }
    }

    /// Thresholds used for the status label on each reading.
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Scores `frame` inside `roi` (whole frame when `None`).
    pub fn estimate(&self, camera_id: &str, frame: &Frame, roi: Option<&Roi>) -> Result<VisibilityReading> {
        frame.ensure_valid()?;
        let mask = RoiMask::for_roi(roi, frame.width(), frame.height());
        self.estimate_masked(camera_id, frame, &mask)
    }

    /// Same as `estimate` with a pre-rasterized mask. A mask built for another
    /// frame size is ignored in favour of the whole frame.
    pub fn estimate_masked(&self, camera_id: &str, frame: &Frame, mask: &RoiMask) -> Result<VisibilityReading> {
        let metrics = self.measure(frame, mask)?;
        let score = self.combine(&metrics);
        Ok(VisibilityReading {
            camera_id: camera_id.to_string(),
            timestamp: frame.captured_at(),
            score,
            metrics,
            status: self.thresholds.classify(score),
            regions: None,
        })
    }

    /// Computes the normalized sub-metrics.
    pub fn measure(&self, frame: &Frame, mask: &RoiMask) -> Result<SubMetrics> {
        frame.ensure_valid()?;
        let (width, height) = frame.dimensions();
        let full;
        let mask = if mask.matches_size(width, height) {
            mask
        } else {
            full = RoiMask::full(width, height);
            &full
        };

        let (w, h) = (width as usize, height as usize);
        let luma: Vec<f64> = frame
            .as_raw()
            .chunks_exact(CHANNELS)
            .map(|p| Pixel::from(p).luminance())
            .collect();

        // Pass 1: means.
        let mut count = 0usize;
        let mut luma_sum = 0.0;
        let mut spread_sum = 0.0;
        for y in 0..height {
            for x in 0..width {
                if !mask.contains(x, y) {
                    continue;
                }
                count += 1;
                luma_sum += luma[y as usize * w + x as usize];
                spread_sum += frame.pixel(x, y).channel_stddev();
            }
        }
        if count == 0 {
            return Err(Error::InvalidFrame("roi selects no pixels".into()));
        }
        let mean_luma = luma_sum / count as f64;
        let mean_spread = spread_sum / count as f64;

        // Pass 2: luminance variance and Sobel edges.
        let mut variance_sum = 0.0;
        let mut interior = 0usize;
        let mut edges = 0usize;
        let threshold_sq = self.config.edge_magnitude_threshold * self.config.edge_magnitude_threshold;
        for y in 0..h {
            for x in 0..w {
                if !mask.contains(x as u32, y as u32) {
                    continue;
                }
                let centre = luma[y * w + x];
                variance_sum += (centre - mean_luma) * (centre - mean_luma);

                if x == 0 || y == 0 || x + 1 >= w || y + 1 >= h {
                    continue;
                }
                interior += 1;
                let at = |dx: isize, dy: isize| {
                    luma[(y as isize + dy) as usize * w + (x as isize + dx) as usize]
                };
                let gx = (at(1, -1) + 2.0 * at(1, 0) + at(1, 1)) - (at(-1, -1) + 2.0 * at(-1, 0) + at(-1, 1));
                let gy = (at(-1, 1) + 2.0 * at(0, 1) + at(1, 1)) - (at(-1, -1) + 2.0 * at(0, -1) + at(1, -1));
                if gx * gx + gy * gy > threshold_sq {
                    edges += 1;
                }
            }
        }
        let luma_std = (variance_sum / count as f64).sqrt();
        let edge_fraction = if interior > 0 { edges as f64 / interior as f64 } else { 0.0 };

        Ok(SubMetrics {
            contrast: unit(luma_std / self.config.contrast_reference),
            edge_density: unit(edge_fraction / self.config.edge_density_reference),
            color_variance: unit(mean_spread / self.config.color_variance_reference),
            brightness: if mean_luma.is_finite() { mean_luma } else { 0.0 },
        })
    }

    /// Weighted average of the normalized sub-metrics.
    pub fn combine(&self, metrics: &SubMetrics) -> f64 {
        let w = &self.config.weights;
        let total = w.sum();
        if total <= 0.0 {
            return 0.0;
        }
        let raw = (w.contrast * metrics.contrast
            + w.edge_density * metrics.edge_density
            + w.color_variance * metrics.color_variance)
            / total;
        unit(raw)
    }
}

#[inline]
fn unit(value: f64) -> f64 {
    if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 }
}
