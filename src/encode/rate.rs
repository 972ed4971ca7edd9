//! Output bitrate measured over a sliding window of access units.

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::warn;

/// Measured rate may deviate this much from the target before we warn.
const DRIFT_TOLERANCE: f64 = 0.5;

pub struct RateMeter {
    window: HeapRb<usize>,
    fps: u32,
    target_kbps: u32,
    warned: bool,
}

impl RateMeter {
    /// Window spans two seconds of frames.
    pub fn new(fps: u32, target_kbps: u32) -> Self {
        let fps = fps.max(1);
        Self {
            window: HeapRb::new((fps * 2) as usize),
            fps,
            target_kbps,
            warned: false,
        }
    }

    pub fn set_target(&mut self, kbps: u32) {
        self.target_kbps = kbps;
        self.window = HeapRb::new((self.fps * 2) as usize);
        self.warned = false;
    }

    /// Record the size of one frame's output, returns the current estimate.
    pub fn record(&mut self, bytes: usize) -> f64 {
        self.window.push_overwrite(bytes);
        let kbps = self.kbps();
        metrics::gauge!("encoder_bitrate_kbps").set(kbps);

        if self.window.is_full() {
            let drift = (kbps - self.target_kbps as f64).abs() / self.target_kbps.max(1) as f64;
            if drift > DRIFT_TOLERANCE && !self.warned {
                warn!(
                    measured_kbps = kbps as u64,
                    target_kbps = self.target_kbps,
                    "encoder output drifting from target bitrate"
                );
                self.warned = true;
            } else if drift <= DRIFT_TOLERANCE {
                self.warned = false;
            }
        }
        kbps
    }

    pub fn kbps(&self) -> f64 {
        let frames = self.window.occupied_len();
        if frames == 0 {
            return 0.0;
        }
        let bytes: usize = self.window.iter().sum();
        bytes as f64 * 8.0 * self.fps as f64 / frames as f64 / 1000.0
    }
}
