//! Error taxonomy for the streaming pipeline.
//!
//! Fatal classes (`Capture`, `Encoder` init, `Config`) unwind to the
//! orchestrator. Runtime detection and network failures never leave their
//! stage; the only detector error that reaches [`PipelineError`] is a model
//! that fails to load at startup.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open capture device {device}: {reason}")]
    Open { device: String, reason: String },

    #[error("unsupported capture format: {0}")]
    Format(String),

    #[error("capture read failed: {0}")]
    Read(#[source] io::Error),

    #[error("frame decode failed: {0}")]
    Decode(String),

    /// A finite source has no more frames. Not a device failure.
    #[error("frame source exhausted after {frames} frames")]
    Exhausted { frames: u64 },
}

impl CaptureError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Exhausted { .. })
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("detector backend failed: {0}")]
    Backend(String),

    #[error("frame {width}x{height} does not match detector input: {reason}")]
    Input {
        width: u32,
        height: u32,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("encoder initialization failed: {0}")]
    Init(String),

    #[error("unsupported encoder resolution {width}x{height}: {reason}")]
    UnsupportedResolution {
        width: u32,
        height: u32,
        reason: &'static str,
    },

    #[error("encoding frame {sequence} failed: {reason}")]
    Encode { sequence: u64, reason: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    /// Only raised while loading the model at startup.
    #[error("detector setup failed: {0}")]
    Detector(#[from] DetectError),

    #[error("pipeline stage {stage} failed: {reason}")]
    Stage { stage: &'static str, reason: String },
}

impl PipelineError {
    pub(crate) fn stage(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            reason: reason.into(),
        }
    }
}
