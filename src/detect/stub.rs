use std::sync::Mutex;
use std::time::Duration;

use crate::capture::Frame;
use crate::detect::detector::{BoundingBox, Detector};
use crate::error::DetectError;

/// Stub detector returning a fixed set of boxes.
///
/// Latency and failures can be injected, and every call is recorded so the
/// scheduling cadence can be checked.
pub struct StubDetector {
    boxes: Vec<BoundingBox>,
    latency: Duration,
    fail_every: Option<u64>,
    calls: Mutex<Vec<u64>>,
}

impl StubDetector {
    pub fn new(boxes: Vec<BoundingBox>) -> Self {
        Self {
            boxes,
            latency: Duration::ZERO,
            fail_every: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A single centred box covering a quarter of the frame.
    pub fn centred(width: u32, height: u32) -> Self {
        let (w, h) = (width as f32 / 2.0, height as f32 / 2.0);
        Self::new(vec![BoundingBox::new(w / 2.0, h / 2.0, w, h, "object", 0.9)])
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every `n`th call (1-based).
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    /// Sequence numbers of every frame passed to `detect`, in call order.
    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectError> {
        let call = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| DetectError::Backend("call log poisoned".into()))?;
            calls.push(frame.sequence());
            calls.len() as u64
        };

        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        if let Some(n) = self.fail_every {
            if call % n == 0 {
                return Err(DetectError::Backend(format!("injected failure on call {call}")));
            }
        }
        Ok(self.boxes.clone())
    }
}
