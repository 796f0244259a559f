pub mod pixel;
pub mod frame;
pub mod roi;
pub mod estimator;
pub mod event_state;
pub mod smart_region;
pub mod frame_source;
pub mod event_log;
pub mod display;
pub mod highlight;
pub mod recorder;
