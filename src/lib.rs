//! Real-time camera pipeline: capture, periodic object detection, overlay,
//! H.264 encoding and streaming to a downstream ingest over TCP.

pub mod capture;
pub mod cli;
pub mod config;
pub mod detect;
pub mod encode;
pub mod error;
pub mod overlay;
pub mod pipeline;
pub mod sink;

pub use capture::{Frame, FrameSource};
pub use config::PipelineConfig;
pub use error::{CaptureError, ConfigError, DetectError, EncoderError, PipelineError};
pub use pipeline::{Pipeline, PipelineReport, Shutdown};
