// OpenCV `VideoWriter` behind the library's encoder and clip-extractor traits.
// Recordings are MPEG-4 Part 2 (`mp4v`), which every OpenCV build can write.

use std::path::Path;

use opencv::{
    core::{self, Mat, Scalar, Size},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};
use tracing::debug;
use visibility_cam::core_modules::frame::Frame;
use visibility_cam::core_modules::highlight::{ClipExtractor, ClipRequest};
use visibility_cam::core_modules::recorder::{EncoderFactory, EncoderParams, VideoEncoder};
use visibility_cam::error::{Error, Result};

fn encoder_error(context: &str) -> impl Fn(opencv::Error) -> Error + '_ {
    move |e| Error::Encoder(format!("{context}: {e}"))
}

fn open_writer(path: &Path, fps: f64, size: Size) -> Result<VideoWriter> {
    let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v').map_err(encoder_error("fourcc"))?;
    let writer = VideoWriter::new(&path.to_string_lossy(), fourcc, fps, size, true)
        .map_err(encoder_error("open writer"))?;
    if !writer.is_opened().map_err(encoder_error("open writer"))? {
        return Err(Error::Encoder(format!("no encoder accepted {}", path.display())));
    }
    Ok(writer)
}

/// RGB frame to a BGR `Mat` of the writer's size.
fn frame_to_bgr(frame: &Frame, size: Size) -> Result<Mat> {
    let mut rgb = Mat::new_rows_cols_with_default(
        frame.height() as i32,
        frame.width() as i32,
        core::CV_8UC3,
        Scalar::all(0.0),
    )
    .map_err(encoder_error("frame buffer"))?;
    rgb.data_bytes_mut().map_err(encoder_error("frame buffer"))?.copy_from_slice(frame.as_raw());

    let mut bgr = Mat::default();
    imgproc::cvt_color(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR, 0).map_err(encoder_error("colour conversion"))?;
    if bgr.cols() == size.width && bgr.rows() == size.height {
        return Ok(bgr);
    }
    let mut resized = Mat::default();
    imgproc::resize(&bgr, &mut resized, size, 0.0, 0.0, imgproc::INTER_LINEAR).map_err(encoder_error("resize"))?;
    Ok(resized)
}

pub struct OpenCvEncoderFactory;

impl EncoderFactory for OpenCvEncoderFactory {
    fn open(&self, path: &Path, params: &EncoderParams) -> Result<Box<dyn VideoEncoder>> {
        let size = Size::new(params.width as i32, params.height as i32);
        let writer = open_writer(path, params.fps, size)?;
        debug!(path = %path.display(), width = params.width, height = params.height, "encoder opened");
        Ok(Box::new(OpenCvEncoder { writer, size }))
    }
}

struct OpenCvEncoder {
    writer: VideoWriter,
    size: Size,
}

impl VideoEncoder for OpenCvEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let bgr = frame_to_bgr(frame, self.size)?;
        self.writer.write(&bgr).map_err(encoder_error("write"))
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.release().map_err(encoder_error("finalize"))
    }
}

/// Seeks into a finished recording and copies a frame range into a new file.
pub struct OpenCvClipExtractor;

impl ClipExtractor for OpenCvClipExtractor {
    fn extract(&self, request: &ClipRequest) -> Result<()> {
        let mut source = VideoCapture::from_file(&request.source.to_string_lossy(), videoio::CAP_ANY)
            .map_err(encoder_error("open recording"))?;
        if !source.is_opened().map_err(encoder_error("open recording"))? {
            return Err(Error::Encoder(format!("cannot read {}", request.source.display())));
        }
        let width = source.get(videoio::CAP_PROP_FRAME_WIDTH).map_err(encoder_error("probe"))? as i32;
        let height = source.get(videoio::CAP_PROP_FRAME_HEIGHT).map_err(encoder_error("probe"))? as i32;
        source
            .set(videoio::CAP_PROP_POS_FRAMES, request.start_frame as f64)
            .map_err(encoder_error("seek"))?;

        let mut writer = open_writer(&request.output, request.fps, Size::new(width, height))?;
        let mut frame = Mat::default();
        let mut copied = 0u64;
        while copied < request.frame_count {
            if !source.read(&mut frame).map_err(encoder_error("read"))? || frame.empty() {
                break;
            }
            writer.write(&frame).map_err(encoder_error("write"))?;
            copied += 1;
        }
        writer.release().map_err(encoder_error("finalize"))?;
        if copied == 0 {
            return Err(Error::Encoder(format!("no frames at offset {} in {}", request.start_frame, request.source.display())));
        }
        debug!(output = %request.output.display(), frames = copied, "clip extracted");
        Ok(())
    }
}
