//! In-process counters backing the end-of-run report.
//!
//! Every counter also has a `metrics` facade counterpart emitted at the point
//! where it is incremented.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Monotonic counter padded to its own cache line.
#[derive(Default)]
pub struct Counter(CachePadded<AtomicU64>);

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Frames per second over a rolling one-second window.
#[derive(Debug)]
pub struct FpsMeter {
    window_start: std::time::Instant,
    frames: u32,
    fps: f32,
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self {
            window_start: std::time::Instant::now(),
            frames: 0,
            fps: 0.0,
        }
    }
}

impl FpsMeter {
    pub fn tick(&mut self) -> f32 {
        self.frames += 1;
        let elapsed = self.window_start.elapsed().as_secs_f32();
        if elapsed >= 1.0 {
            self.fps = self.frames as f32 / elapsed;
            self.frames = 0;
            self.window_start = std::time::Instant::now();
        }
        self.fps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_sums_across_threads() {
        let counter = Arc::new(Counter::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&counter);
                std::thread::spawn(move || (0..1000).for_each(|_| c.incr()))
            })
            .collect();
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(counter.get(), 4000);
    }
}
