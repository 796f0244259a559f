// OpenCV-backed `StreamBackend`: RTSP/HTTP URLs and files go through the FFmpeg
// backend with open/read timeouts, device indices through whatever backend the
// platform offers. Frames leave here as RGB `image` buffers.

use opencv::{
    core::{Mat, Vector},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use visibility_cam::config::{StreamSettings, StreamUri};
use visibility_cam::core_modules::frame::Frame;
use visibility_cam::core_modules::frame_source::{StreamBackend, StreamConnection};
use visibility_cam::error::{Error, Result};

pub(crate) fn stream_error(context: &str) -> impl Fn(opencv::Error) -> Error + '_ {
    move |e| Error::stream(format!("{context}: {e}"))
}

/// Converts a BGR `Mat` into an RGB frame stamped now.
pub(crate) fn mat_to_frame(bgr: &Mat) -> Result<Frame> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(bgr, &mut rgb, imgproc::COLOR_BGR2RGB, 0).map_err(stream_error("colour conversion"))?;
    let width = rgb.cols().max(0) as u32;
    let height = rgb.rows().max(0) as u32;
    let data = rgb.data_bytes().map_err(stream_error("frame buffer"))?.to_vec();
    Frame::from_raw(width, height, data, chrono::Utc::now())
}

pub struct OpenCvBackend;

impl StreamBackend for OpenCvBackend {
    fn open(&self, uri: &StreamUri, settings: &StreamSettings) -> Result<Box<dyn StreamConnection>> {
        let capture = match uri {
            StreamUri::Url(url) => {
                let params = Vector::from_slice(&[
                    videoio::CAP_PROP_OPEN_TIMEOUT_MSEC,
                    settings.connect_timeout_ms as i32,
                    videoio::CAP_PROP_READ_TIMEOUT_MSEC,
                    settings.read_timeout_ms as i32,
                ]);
                VideoCapture::from_file_with_params(url, videoio::CAP_FFMPEG, &params)
            }
            StreamUri::File(path) => VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY),
            StreamUri::Device(index) => VideoCapture::new(*index as i32, videoio::CAP_ANY),
        }
        .map_err(stream_error("open"))?;

        if !capture.is_opened().map_err(stream_error("open"))? {
            return Err(Error::stream(format!("could not open {uri}")));
        }
        let mut capture = capture;
        // Keep the decoder close to live instead of queueing stale frames.
        let _ = capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
        Ok(Box::new(OpenCvConnection { capture, bgr: Mat::default() }))
    }
}

struct OpenCvConnection {
    capture: VideoCapture,
    bgr: Mat,
}

impl StreamConnection for OpenCvConnection {
    fn read_frame(&mut self) -> Result<Frame> {
        let read = self.capture.read(&mut self.bgr).map_err(stream_error("read"))?;
        if !read || self.bgr.empty() {
            return Err(Error::stream("empty frame or end of stream"));
        }
        mat_to_frame(&self.bgr)
    }
}

impl Drop for OpenCvConnection {
    fn drop(&mut self) {
        let _ = self.capture.release();
    }
}
