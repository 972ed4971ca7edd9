use bytes::Bytes;

use crate::config::{PipelineConfig, MAX_DIMENSION};
use crate::error::EncoderError;
use crate::overlay::AnnotatedFrame;

/// Parameters a codec backend is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub keyframe_interval: u32,
}

impl EncoderSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            width: config.capture.width,
            height: config.capture.height,
            fps: config.capture.fps,
            bitrate_kbps: config.encoder.bitrate_kbps,
            keyframe_interval: config.encoder.keyframe_interval,
        }
    }

    pub fn check_resolution(&self) -> Result<(), EncoderError> {
        let unsupported = |reason| EncoderError::UnsupportedResolution {
            width: self.width,
            height: self.height,
            reason,
        };
        if self.width == 0 || self.height == 0 {
            return Err(unsupported("zero-sized frame"));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(unsupported("4:2:0 chroma needs even dimensions"));
        }
        if self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(unsupported("exceeds the largest supported frame"));
        }
        Ok(())
    }

    /// Nanoseconds per frame, used for presentation timestamps.
    pub fn frame_duration_ns(&self) -> u64 {
        1_000_000_000 / self.fps.max(1) as u64
    }
}

/// One access unit as produced by a backend.
#[derive(Debug, Clone)]
pub struct CodedUnit {
    pub data: Bytes,
    pub is_keyframe: bool,
    pub sequence: u64,
}

/// H.264 compressor behind the encoder stage.
///
/// A backend may buffer internally and return zero or several units per
/// call, but units come back in input order.
pub trait CodecBackend: Send {
    fn name(&self) -> &'static str;

    fn encode(&mut self, frame: &AnnotatedFrame, force_keyframe: bool) -> Result<Vec<CodedUnit>, EncoderError>;

    fn set_bitrate(&mut self, kbps: u32) -> Result<(), EncoderError>;

    /// Drain anything still buffered at end of stream.
    fn finish(&mut self) -> Result<Vec<CodedUnit>, EncoderError> {
        Ok(Vec::new())
    }
}
