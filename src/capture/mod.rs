pub mod decoder;
pub mod frame;
pub mod synthetic;

#[cfg(feature = "v4l2")]
pub mod devices;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{Frame, FrameMetadata, FrameStamper, PixelFormat};
pub use synthetic::TestPatternSource;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Capture;

use crate::error::CaptureError;

/// Blocking producer of RGB24 frames.
///
/// `next` blocks until a frame is available. Sequence number and capture
/// timestamp are assigned together at acquisition.
pub trait FrameSource: Send {
    fn describe(&self) -> String;

    fn start(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn next(&mut self) -> Result<Frame, CaptureError>;

    fn stop(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        (**self).start()
    }

    fn next(&mut self) -> Result<Frame, CaptureError> {
        (**self).next()
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}

/// Open the frame source selected by `config.source`.
pub fn open_source(config: &crate::config::CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    use crate::config::SourceKind;

    let source: Box<dyn FrameSource> = match config.source {
        SourceKind::TestPattern => {
            let mut pattern = TestPatternSource::new(config.width, config.height, config.fps);
            if let Some(limit) = config.frame_limit {
                pattern = pattern.with_limit(limit);
            }
            Box::new(pattern)
        }
        #[cfg(feature = "v4l2")]
        SourceKind::Device => Box::new(V4l2Capture::open(config)?),
        #[cfg(not(feature = "v4l2"))]
        SourceKind::Device => {
            return Err(CaptureError::Open {
                device: format!("/dev/video{}", config.device_index),
                reason: "built without the v4l2 feature".into(),
            })
        }
    };
    Ok(source)
}
