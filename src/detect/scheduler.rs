//! Per-frame inference scheduling.
//!
//! The forwarding path only decides and submits; inference runs on the blocking
//! pool and publishes into the [`DetectionCache`] when it completes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::capture::Frame;
use crate::config::DetectionConfig;
use crate::detect::cache::DetectionCache;
use crate::detect::detector::{DetectionResult, Detector};
use crate::pipeline::stats::Counter;

#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub submitted: Counter,
    /// Eligible frames not submitted because the in-flight limit was reached.
    pub skipped: Counter,
    pub published: Counter,
    /// Completed, but the cache already held a newer frame.
    pub stale: Counter,
    pub failed: Counter,
    pub timed_out: Counter,
}

/// What the scheduler did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    NotDue,
    Submitted,
    Busy,
}

pub struct DetectionScheduler {
    detector: Arc<dyn Detector>,
    cache: Arc<DetectionCache>,
    interval: u64,
    threshold: f32,
    max_in_flight: usize,
    timeout: Duration,
    in_flight: Arc<AtomicUsize>,
    /// Submissions whose outcome has not been handled yet.
    pending: Arc<AtomicUsize>,
    stats: Arc<SchedulerStats>,
    runtime: Handle,
}

/// Releases an in-flight slot when the detector call returns.
struct InFlightSlot(Arc<AtomicUsize>);

impl InFlightSlot {
    fn acquire(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(count))
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl DetectionScheduler {
    pub fn new(
        detector: Arc<dyn Detector>,
        cache: Arc<DetectionCache>,
        config: &DetectionConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            detector,
            cache,
            interval: config.interval.max(1) as u64,
            threshold: config.confidence_threshold,
            max_in_flight: config.max_in_flight.max(1),
            timeout: Duration::from_millis(config.inference_timeout_ms),
            in_flight: Arc::new(AtomicUsize::new(0)),
            pending: Arc::new(AtomicUsize::new(0)),
            stats: Arc::new(SchedulerStats::default()),
            runtime,
        }
    }

    pub fn is_due(&self, sequence: u64) -> bool {
        sequence % self.interval == 0
    }

    pub fn cache(&self) -> &Arc<DetectionCache> {
        &self.cache
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Decide synchronously whether `frame` gets inference, and submit it if so.
    ///
    /// Never waits on the detector.
    pub fn observe(&self, frame: &Frame) -> Dispatch {
        let sequence = frame.sequence();
        if !self.is_due(sequence) {
            return Dispatch::NotDue;
        }

        let max = self.max_in_flight;
        let reserved = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            self.stats.skipped.incr();
            metrics::counter!("detection_skipped_total").increment(1);
            debug!(sequence, "detector busy, frame not submitted");
            return Dispatch::Busy;
        }

        self.stats.submitted.incr();
        metrics::counter!("detection_runs_total").increment(1);

        let slot = InFlightSlot(Arc::clone(&self.in_flight));
        let task = InFlightSlot::acquire(&self.pending);
        let detector = Arc::clone(&self.detector);
        let frame = frame.clone();
        let inference = self.runtime.spawn_blocking(move || {
            let _slot = slot;
            let start = Instant::now();
            let outcome = detector.detect(&frame);
            (outcome, start.elapsed())
        });

        let cache = Arc::clone(&self.cache);
        let stats = Arc::clone(&self.stats);
        let threshold = self.threshold;
        let timeout = self.timeout;
        self.runtime.spawn(async move {
            let _task = task;
            match tokio::time::timeout(timeout, inference).await {
                Err(_) => {
                    stats.timed_out.incr();
                    metrics::counter!("detection_timeouts_total").increment(1);
                    warn!(sequence, ?timeout, "inference timed out, keeping last detections");
                }
                Ok(Err(join_err)) => {
                    stats.failed.incr();
                    metrics::counter!("detection_failures_total").increment(1);
                    warn!(sequence, "inference task aborted: {}", join_err);
                }
                Ok(Ok((Err(e), _))) => {
                    stats.failed.incr();
                    metrics::counter!("detection_failures_total").increment(1);
                    warn!(sequence, "inference failed, keeping last detections: {}", e);
                }
                Ok(Ok((Ok(boxes), elapsed))) => {
                    metrics::histogram!("detection_latency_ms").record(elapsed.as_secs_f64() * 1e3);
                    let result = DetectionResult::from_raw(sequence, boxes, threshold);
                    let count = result.len();
                    if cache.publish(result) {
                        stats.published.incr();
                        debug!(sequence, count, ?elapsed, "detections published");
                    } else {
                        stats.stale.incr();
                        debug!(sequence, "newer detections already cached, result dropped");
                    }
                }
            }
        });

        Dispatch::Submitted
    }

    /// Wait until every submitted frame has been published, discarded or
    /// timed out, up to `limit`.
    pub async fn settle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.in_flight() > 0 || self.pending.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameStamper, PixelFormat};
    use crate::detect::detector::BoundingBox;
    use crate::detect::stub::StubDetector;
    use bytes::Bytes;

    fn config(interval: u32, max_in_flight: usize) -> DetectionConfig {
        DetectionConfig {
            interval,
            max_in_flight,
            confidence_threshold: 0.5,
            inference_timeout_ms: 1_000,
            ..DetectionConfig::default()
        }
    }

    fn frames(n: u64) -> Vec<Frame> {
        let mut stamper = FrameStamper::new();
        (0..n)
            .map(|_| stamper.rgb_frame(Bytes::from(vec![0u8; 4 * 4 * 3]), 4, 4, PixelFormat::Rgb24, None))
            .collect()
    }

    async fn wait_for_sequence(cache: &DetectionCache, sequence: u64) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while cache.sequence() < Some(sequence) {
            assert!(Instant::now() < deadline, "frame {sequence} never published");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn only_interval_multiples_are_submitted() {
        let detector = Arc::new(StubDetector::centred(4, 4));
        let cache = Arc::new(DetectionCache::new());
        let scheduler =
            DetectionScheduler::new(detector.clone(), cache.clone(), &config(3, 4), Handle::current());

        for frame in frames(30) {
            let dispatch = scheduler.observe(&frame);
            if frame.sequence() % 3 == 0 {
                assert_eq!(dispatch, Dispatch::Submitted);
                wait_for_sequence(&cache, frame.sequence()).await;
            } else {
                assert_eq!(dispatch, Dispatch::NotDue);
            }
        }
        assert!(scheduler.settle(Duration::from_secs(1)).await);
        let expected: Vec<u64> = (0..30).step_by(3).collect();
        assert_eq!(detector.calls(), expected);
        assert_eq!(scheduler.stats().published.get(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_detector_never_blocks_observe() {
        let detector = Arc::new(StubDetector::centred(4, 4).with_latency(Duration::from_millis(200)));
        let cache = Arc::new(DetectionCache::new());
        let scheduler =
            DetectionScheduler::new(detector.clone(), cache.clone(), &config(1, 1), Handle::current());

        let start = Instant::now();
        let dispatches: Vec<_> = frames(10).iter().map(|f| scheduler.observe(f)).collect();
        assert!(start.elapsed() < Duration::from_millis(100));

        assert_eq!(dispatches[0], Dispatch::Submitted);
        assert!(dispatches[1..].iter().all(|d| *d == Dispatch::Busy));
        assert_eq!(scheduler.stats().skipped.get(), 9);

        assert!(scheduler.settle(Duration::from_secs(2)).await);
        wait_for_sequence(&cache, 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failures_keep_the_previous_result() {
        let detector = Arc::new(StubDetector::centred(4, 4).failing_every(2));
        let cache = Arc::new(DetectionCache::new());
        let scheduler =
            DetectionScheduler::new(detector.clone(), cache.clone(), &config(1, 1), Handle::current());

        let all = frames(2);
        scheduler.observe(&all[0]);
        wait_for_sequence(&cache, 0).await;
        scheduler.observe(&all[1]);
        assert!(scheduler.settle(Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cache.sequence(), Some(0));
        assert_eq!(scheduler.stats().failed.get(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_inference_is_discarded() {
        let detector = Arc::new(StubDetector::centred(4, 4).with_latency(Duration::from_millis(150)));
        let cache = Arc::new(DetectionCache::new());
        let mut cfg = config(1, 1);
        cfg.inference_timeout_ms = 20;
        let scheduler = DetectionScheduler::new(detector, cache.clone(), &cfg, Handle::current());

        scheduler.observe(&frames(1)[0]);
        assert!(scheduler.settle(Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cache.load().is_none());
        assert_eq!(scheduler.stats().timed_out.get(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn low_confidence_boxes_are_never_published() {
        let detector = Arc::new(StubDetector::new(vec![
            BoundingBox::new(0.0, 0.0, 2.0, 2.0, "keep", 0.8),
            BoundingBox::new(0.0, 0.0, 2.0, 2.0, "drop", 0.2),
        ]));
        let cache = Arc::new(DetectionCache::new());
        let scheduler = DetectionScheduler::new(detector, cache.clone(), &config(1, 1), Handle::current());

        scheduler.observe(&frames(1)[0]);
        wait_for_sequence(&cache, 0).await;
        let result = cache.load().unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.boxes()[0].label, "keep");
    }
}
