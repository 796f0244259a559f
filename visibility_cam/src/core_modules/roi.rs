// THEORY:
// A region of interest restricts visibility scoring to the part of the scene that
// matters (a horizon band, a distant landmark) and keeps foreground clutter such
// as a railing or the camera housing out of the statistics.
//
// ROIs are stored in normalized coordinates (0..1 of width/height) so a config
// survives a resolution change on the camera side. Before scoring they are
// rasterized into a `RoiMask`, one bool per pixel. A pixel belongs to the region
// when its centre `(x + 0.5, y + 0.5)` lies inside the shape.
//
// - Rect: half-open box test, rasterized row by row as a column span.
// - Polygon: even-odd rule, rasterized with a scanline: for each row centre the
//   edge crossings are sorted and the spans between pairs are filled. Edges use
//   the half-open `(y0 <= cy) != (y1 <= cy)` test so shared vertices count once.
//
// A mask that selects no pixels falls back to the whole frame.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Roi {
    Rect { x: f64, y: f64, width: f64, height: f64 },
    Polygon { points: Vec<(f64, f64)> },
}

impl Roi {
    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        match self {
            Roi::Rect { x, y, width, height } => {
                if !(in_unit(*x) && in_unit(*y) && in_unit(*width) && in_unit(*height)) {
                    return Err(Error::config("rect roi coordinates must lie in 0..1"));
                }
                if *width <= 0.0 || *height <= 0.0 {
                    return Err(Error::config("rect roi must have positive width and height"));
                }
                if x + width > 1.0 + 1e-9 || y + height > 1.0 + 1e-9 {
                    return Err(Error::config("rect roi extends past the frame"));
                }
                Ok(())
            }
            Roi::Polygon { points } => {
                if points.len() < 3 {
                    return Err(Error::config("polygon roi needs at least 3 points"));
                }
                if points.iter().any(|&(px, py)| !(in_unit(px) && in_unit(py))) {
                    return Err(Error::config("polygon roi points must lie in 0..1"));
                }
                Ok(())
            }
        }
    }

    /// Rasterizes the region for a `width` x `height` frame.
    pub fn mask(&self, width: u32, height: u32) -> RoiMask {
        let (w, h) = (width as usize, height as usize);
        let mut bits = vec![false; w * h];
        match self {
            Roi::Rect { x, y, width: rw, height: rh } => {
                let (col_start, col_end) = span(x * w as f64, (x + rw) * w as f64, w);
                let (row_start, row_end) = span(y * h as f64, (y + rh) * h as f64, h);
                for row in row_start..row_end {
                    bits[row * w + col_start..row * w + col_end].fill(true);
                }
            }
            Roi::Polygon { points } => {
                let scaled: Vec<(f64, f64)> = points
                    .iter()
                    .map(|&(px, py)| (px * w as f64, py * h as f64))
                    .collect();
                let mut crossings: Vec<f64> = Vec::with_capacity(scaled.len());
                for row in 0..h {
                    let cy = row as f64 + 0.5;
                    crossings.clear();
                    for (i, &(x0, y0)) in scaled.iter().enumerate() {
                        let (x1, y1) = scaled[(i + 1) % scaled.len()];
                        if (y0 <= cy) != (y1 <= cy) {
                            let t = (cy - y0) / (y1 - y0);
                            crossings.push(x0 + t * (x1 - x0));
                        }
                    }
                    crossings.sort_by(|a, b| a.total_cmp(b));
                    for pair in crossings.chunks_exact(2) {
                        let (col_start, col_end) = span(pair[0], pair[1], w);
                        bits[row * w + col_start..row * w + col_end].fill(true);
                    }
                }
            }
        }
        RoiMask::from_bits(width, height, bits)
    }
}

/// Columns (or rows) whose centre `c + 0.5` lies in `[lo, hi)`, clamped to `0..len`.
fn span(lo: f64, hi: f64, len: usize) -> (usize, usize) {
    let start = (lo - 0.5).ceil().clamp(0.0, len as f64) as usize;
    let end = (hi - 0.5).ceil().clamp(0.0, len as f64) as usize;
    (start, end.max(start))
}

/// Per-pixel membership for one frame size.
#[derive(Debug, Clone, PartialEq)]
pub struct RoiMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
    count: usize,
}

impl RoiMask {
    /// Every pixel selected.
    pub fn full(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize;
        RoiMask { width, height, bits: vec![true; len], count: len }
    }

    fn from_bits(width: u32, height: u32, bits: Vec<bool>) -> Self {
        let count = bits.iter().filter(|b| **b).count();
        if count == 0 {
            return RoiMask::full(width, height);
        }
        RoiMask { width, height, bits, count }
    }

    /// Mask for an optional ROI; `None` selects the whole frame.
    pub fn for_roi(roi: Option<&Roi>, width: u32, height: u32) -> Self {
        match roi {
            Some(roi) => roi.mask(width, height),
            None => RoiMask::full(width, height),
        }
    }

    #[inline]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.bits[y as usize * self.width as usize + x as usize]
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_full(&self) -> bool {
        self.count == self.bits.len()
    }

    pub fn matches_size(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }
}
