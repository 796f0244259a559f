//! Error taxonomy for the visibility engine.
//!
//! Only `ConfigValidation` is ever fatal (and only at startup). Every other
//! variant is local to one camera unit: stream failures are retried, invalid
//! frames skip a tick, recording failures become warnings and weather
//! failures fall back to synthetic data.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The stream could not be opened or read. Transient; retried with backoff.
    #[error("stream unavailable: {0}")]
    StreamUnavailable(String),

    /// The frame is empty or its pixel buffer does not match its dimensions.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The encoder for a new recording could not be opened.
    #[error("encoder failed to start for {}: {reason}", path.display())]
    EncoderStartFailure { path: PathBuf, reason: String },

    /// An encode task did not finish within its finalize window.
    #[error("encoder for {} did not finalize within {timeout:?}", path.display())]
    EncoderFinalizeTimeout { path: PathBuf, timeout: Duration },

    /// A running encoder or clip extractor reported an error.
    #[error("encoder error: {0}")]
    Encoder(String),

    /// Configuration rejected at load or update time.
    #[error("config validation error: {0}")]
    ConfigValidation(String),

    /// Weather lookup failed; callers fall back to synthetic data.
    #[error("weather lookup failed: {0}")]
    WeatherLookup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::ConfigValidation(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Error::StreamUnavailable(msg.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::WeatherLookup(e.to_string())
    }
}
