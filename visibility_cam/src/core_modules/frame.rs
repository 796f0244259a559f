// THEORY:
// A `Frame` is one decoded image from a camera together with the wall-clock time
// it was captured. It is the unit of data every downstream stage consumes: the
// estimator reads its pixels, the recorder encodes it, the display shows it.
//
// Frames are immutable once built. Sharing across the estimator, the encode task
// and display consumers goes through `Arc<Frame>`, so one decode feeds all of
// them without copies.

use chrono::{DateTime, Utc};
use image::RgbImage;

use crate::core_modules::pixel::pixel::{CHANNELS, Pixel};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbImage,
    captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: DateTime<Utc>) -> Self {
        Frame { image, captured_at }
    }

    /// Builds a frame from a packed RGB buffer.
    ///
    /// Returns `InvalidFrame` when the buffer length is not `width * height * 3`.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>, captured_at: DateTime<Utc>) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(Error::InvalidFrame(format!(
                "buffer holds {} bytes, {}x{} RGB needs {}",
                data.len(),
                width,
                height,
                expected
            )));
        }
        let image = RgbImage::from_raw(width, height, data)
            .ok_or_else(|| Error::InvalidFrame(format!("cannot wrap {}x{} buffer", width, height)))?;
        Ok(Frame::new(image, captured_at))
    }

    /// A frame filled with one colour. Handy for tests and placeholders.
    pub fn uniform(width: u32, height: u32, rgb: [u8; 3], captured_at: DateTime<Utc>) -> Self {
        Frame::new(RgbImage::from_pixel(width, height, image::Rgb(rgb)), captured_at)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Pixel at `(x, y)`; callers keep coordinates inside the frame.
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> Pixel {
        let p = self.image.get_pixel(x, y);
        Pixel::new(p[0], p[1], p[2])
    }

    /// Fails with `InvalidFrame` for zero-sized frames.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::InvalidFrame(format!(
                "empty frame ({}x{})",
                self.width(),
                self.height()
            )));
        }
        Ok(())
    }
}
