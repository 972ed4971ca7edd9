use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Captured frame handed down the pipeline.
///
/// Pixel data is always packed RGB24 once a frame leaves its source. The
/// buffer is immutable; stages that draw on it work on a copy.
#[derive(Clone)]
pub struct Frame {
    pub data: Bytes,

    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    /// Format delivered by the device before conversion to RGB24.
    pub source_format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats a capture device may deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
}

impl PixelFormat {
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Yuyv4 => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
        }
    }
}

/// Hands out sequence numbers and capture timestamps together.
///
/// Sequence numbers start at zero and increase by exactly one per acquired
/// frame.
#[derive(Debug, Default)]
pub struct FrameStamper {
    next: u64,
}

impl FrameStamper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&mut self) -> (u64, Instant) {
        let sequence = self.next;
        self.next += 1;
        (sequence, Instant::now())
    }

    /// Number of frames stamped so far.
    pub fn issued(&self) -> u64 {
        self.next
    }

    /// Builds an RGB24 frame from already converted pixels.
    pub fn rgb_frame(
        &mut self,
        data: Bytes,
        width: u32,
        height: u32,
        source_format: PixelFormat,
        device_timestamp: Option<Duration>,
    ) -> Frame {
        let (sequence, timestamp) = self.stamp();
        Frame {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                stride: width * 3,
                source_format,
                device_timestamp,
            }),
            timestamp,
        }
    }
}
