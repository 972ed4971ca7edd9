//! Synthetic test-pattern source for dry runs and hardware-free tests.

use std::time::{Duration, Instant};

use bytes::Bytes;

use super::frame::{Frame, FrameStamper, PixelFormat};
use super::FrameSource;
use crate::error::CaptureError;

/// Moving-gradient frames produced at a fixed cadence.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame_interval: Option<Duration>,
    limit: Option<u64>,
    stamper: FrameStamper,
    next_deadline: Option<Instant>,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            frame_interval: Some(Duration::from_secs_f64(1.0 / fps.max(1) as f64)),
            limit: None,
            stamper: FrameStamper::new(),
            next_deadline: None,
        }
    }

    /// Stop with [`CaptureError::Exhausted`] after `frames` frames.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Produce frames as fast as they are requested.
    pub fn unpaced(mut self) -> Self {
        self.frame_interval = None;
        self
    }

    fn pace(&mut self) {
        let Some(interval) = self.frame_interval else {
            return;
        };
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        // Do not accumulate debt after a stall.
        self.next_deadline = Some(deadline.max(now) + interval);
    }

    fn render(&self, sequence: u64) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0u8; w * h * 3];
        let shift = (sequence * 4) as usize;
        let bar = (sequence as usize * 8) % w.max(1);
        for y in 0..h {
            let row = &mut data[y * w * 3..(y + 1) * w * 3];
            for x in 0..w {
                let px = &mut row[x * 3..x * 3 + 3];
                if x >= bar && x < bar + 16 {
                    px.copy_from_slice(&[255, 255, 255]);
                } else {
                    px[0] = ((x + shift) * 255 / w.max(1)) as u8;
                    px[1] = (y * 255 / h.max(1)) as u8;
                    px[2] = 96;
                }
            }
        }
        data
    }
}

impl FrameSource for TestPatternSource {
    fn describe(&self) -> String {
        format!("test pattern {}x{}", self.width, self.height)
    }

    fn next(&mut self) -> Result<Frame, CaptureError> {
        if let Some(limit) = self.limit {
            if self.stamper.issued() >= limit {
                return Err(CaptureError::Exhausted { frames: limit });
            }
        }
        self.pace();
        let pixels = self.render(self.stamper.issued());
        Ok(self.stamper.rgb_frame(
            Bytes::from(pixels),
            self.width,
            self.height,
            PixelFormat::Rgb24,
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limited_source_reports_exhaustion() {
        let mut source = TestPatternSource::new(8, 4, 30).unpaced().with_limit(3);
        for expected in 0..3 {
            let frame = source.next().unwrap();
            assert_eq!(frame.sequence(), expected);
            assert_eq!(frame.data.len(), 8 * 4 * 3);
        }
        let err = source.next().unwrap_err();
        assert!(matches!(err, CaptureError::Exhausted { frames: 3 }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn paced_source_holds_its_rate() {
        let mut source = TestPatternSource::new(4, 4, 100).with_limit(10);
        let start = Instant::now();
        while source.next().is_ok() {}
        // Ten frames at 100 fps: nine full intervals.
        assert!(start.elapsed() >= Duration::from_millis(85));
    }
}
