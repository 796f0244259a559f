// THEORY:
// This file is the main entry point for the `visibility_cam` library crate.
// It exposes two layers:
//
// - `ParallelPipeline` runs every configured camera and is what the monitor
//   binary drives. `CameraPipeline` is the single-camera unit underneath it.
// - The building blocks in `core_modules` (estimator, event state machine,
//   recorder, event log) are public too, so they can be exercised on their own.
//
// Everything platform-specific (stream decoding, video encoding) sits behind the
// `StreamBackend` and `EncoderFactory` traits; the library itself never links a
// video stack.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;
pub mod weather;

pub use config::{AppConfig, CameraConfig, ConfigStore, StreamSettings, StreamUri};
pub use core_modules::estimator::{EstimatorConfig, VisibilityEstimator, VisibilityReading};
pub use core_modules::event_log::{EventLogSink, LogRecord, LogSummary, TimeRange};
pub use core_modules::event_state::{EventStateMachine, EventTransition, Mode, Thresholds};
pub use core_modules::frame::Frame;
pub use error::{Error, Result};
pub use parallel_pipeline::{MonitorDeps, ParallelPipeline};
pub use pipeline::{CameraPipeline, CameraStatus};
pub use weather::{WeatherReport, WeatherService, get_weather};
