use serde::Serialize;
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;

/// Capture device found while probing `/dev/video*`.
#[derive(Debug, Clone, Serialize)]
pub struct FoundDevice {
    pub index: u32,
    pub path: String,
    pub card: String,
    pub formats: Vec<PixelFormat>,
}

impl FoundDevice {
    /// Preferred format: MJPEG keeps USB bandwidth low at 720p30.
    pub fn preferred_format(&self) -> Option<PixelFormat> {
        [PixelFormat::Mjpeg, PixelFormat::Yuyv4]
            .into_iter()
            .find(|f| self.formats.contains(f))
    }
}

/// Enumerate capture devices supporting MJPEG or YUYV.
pub fn list_devices() -> Vec<FoundDevice> {
    use std::path::Path;

    info!("Probing capture devices...");

    let mut found = Vec::new();
    for index in 0..10u32 {
        let path = format!("/dev/video{}", index);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            debug!("Cannot open {}", path);
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }

        let formats: Vec<PixelFormat> = dev
            .enum_formats()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|fmt| {
                if fmt.fourcc == FourCC::new(b"MJPG") {
                    Some(PixelFormat::Mjpeg)
                } else if fmt.fourcc == FourCC::new(b"YUYV") {
                    Some(PixelFormat::Yuyv4)
                } else {
                    None
                }
            })
            .collect();

        if !formats.is_empty() {
            info!("Found capture device: {} - {}", path, caps.card);
            found.push(FoundDevice {
                index,
                path,
                card: caps.card,
                formats,
            });
        }
    }
    found
}
