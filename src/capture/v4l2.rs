//! V4L2 camera capture with memory-mapped buffers

use std::time::Duration;

use bytes::Bytes;
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::decoder::{self, RgbPixels};
use super::frame::{Frame, FrameStamper, PixelFormat};
use super::FrameSource;
use crate::config::CaptureConfig;
use crate::error::CaptureError;

/// Consecutive undecodable frames tolerated before the device is declared lost.
const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 30;

pub struct V4l2Capture {
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    path: String,
    format: PixelFormat,
    buffer_count: u32,
    /// Resolution negotiated with the driver.
    device_size: (u32, u32),
    /// Resolution handed to the pipeline.
    output_size: (u32, u32),
    stamper: FrameStamper,
    decode_failures: u32,
}

impl V4l2Capture {
    /// Open `/dev/video{index}` and negotiate the configured format.
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let path = format!("/dev/video{}", config.device_index);
        info!("Initializing V4L2 capture: {}", path);

        let open_err = |reason: String| CaptureError::Open {
            device: path.clone(),
            reason,
        };

        let device = Device::with_path(&path).map_err(|e| open_err(e.to_string()))?;

        let caps = device.query_caps().map_err(|e| open_err(e.to_string()))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(open_err("device doesn't support video capture".into()));
        }

        let mut fmt = device.format().map_err(|e| open_err(e.to_string()))?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = match config.format {
            PixelFormat::Mjpeg | PixelFormat::Yuyv4 => FourCC::new(&config.format.fourcc()),
            other => {
                return Err(CaptureError::Format(format!(
                    "{other:?} is not a V4L2 capture format"
                )))
            }
        };

        let actual = device
            .set_format(&fmt)
            .map_err(|e| CaptureError::Format(e.to_string()))?;
        if actual.fourcc != fmt.fourcc {
            return Err(CaptureError::Format(format!(
                "device refused {:?}, offered {}",
                config.format, actual.fourcc
            )));
        }
        if actual.width != config.width || actual.height != config.height {
            warn!(
                "Device negotiated {}x{}, frames will be resized to {}x{}",
                actual.width, actual.height, config.width, config.height
            );
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            warn!("Failed to set {} fps: {}", config.fps, e);
        }

        Ok(Self {
            device: Box::new(device),
            stream: None,
            path,
            format: config.format,
            buffer_count: config.buffer_count,
            device_size: (actual.width, actual.height),
            output_size: (config.width, config.height),
            stamper: FrameStamper::new(),
            decode_failures: 0,
        })
    }

    fn convert(&self, raw: &[u8]) -> Result<Vec<u8>, CaptureError> {
        let (dw, dh) = self.device_size;
        let (ow, oh) = self.output_size;
        let pixels: RgbPixels = decoder::decode_frame(raw, self.format, dw, dh)?;
        decoder::resize_rgb(pixels, ow, oh)
    }
}

impl FrameSource for V4l2Capture {
    fn describe(&self) -> String {
        format!("v4l2 {} ({:?})", self.path, self.format)
    }

    /// Start streaming with memory-mapped buffers
    fn start(&mut self) -> Result<(), CaptureError> {
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)
            .map_err(|e| CaptureError::Open {
                device: self.path.clone(),
                reason: format!("failed to map buffers: {e}"),
            })?;

        self.stream = Some(stream);
        info!("Capture stream started with {} buffers", self.buffer_count);
        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    fn next(&mut self) -> Result<Frame, CaptureError> {
        loop {
            let stream = self.stream.as_mut().ok_or_else(|| {
                CaptureError::Read(std::io::Error::other("stream not started"))
            })?;

            let (buf, meta) = stream.next().map_err(CaptureError::Read)?;
            let used = match meta.bytesused as usize {
                0 => buf.len(),
                n => n.min(buf.len()),
            };
            let device_timestamp = Duration::from_secs(meta.timestamp.sec as u64)
                + Duration::from_micros(meta.timestamp.usec as u64);
            let raw = buf[..used].to_vec();

            match self.convert(&raw) {
                Ok(rgb) => {
                    self.decode_failures = 0;
                    let (w, h) = self.output_size;
                    return Ok(self.stamper.rgb_frame(
                        Bytes::from(rgb),
                        w,
                        h,
                        self.format,
                        Some(device_timestamp),
                    ));
                }
                Err(e) => {
                    self.decode_failures += 1;
                    if self.decode_failures >= MAX_CONSECUTIVE_DECODE_FAILURES {
                        return Err(CaptureError::Read(std::io::Error::other(format!(
                            "{} consecutive undecodable frames, last: {e}",
                            self.decode_failures
                        ))));
                    }
                    warn!("Skipping undecodable frame: {}", e);
                }
            }
        }
    }

    fn stop(&mut self) {
        if self.stream.take().is_some() {
            info!("Capture stream stopped after {} frames", self.stamper.issued());
        }
    }
}
