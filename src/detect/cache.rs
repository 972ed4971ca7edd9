//! Latest-detection cell shared by the scheduler and the compositor.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use super::detector::DetectionResult;

/// Holds the most recent complete [`DetectionResult`].
///
/// Results are immutable once published and replaced by pointer swap, so a
/// reader sees either the previous or the new result in full.
#[derive(Default)]
pub struct DetectionCache {
    slot: ArcSwapOption<DetectionResult>,
}

impl DetectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Option<Arc<DetectionResult>> {
        self.slot.load_full()
    }

    /// Sequence number of the cached result.
    pub fn sequence(&self) -> Option<u64> {
        let guard = self.slot.load();
        (*guard).as_ref().map(|r| r.sequence)
    }

    /// Publish `result` unless the cache already holds the same or a newer frame.
    ///
    /// Returns whether the result was stored. Concurrent publishers race
    /// through read-copy-update, so the highest sequence always wins.
    pub fn publish(&self, result: DetectionResult) -> bool {
        let candidate = Arc::new(result);
        let mut stored = false;
        self.slot.rcu(|current| match current {
            Some(existing) if existing.sequence >= candidate.sequence => {
                stored = false;
                Some(Arc::clone(existing))
            }
            _ => {
                stored = true;
                Some(Arc::clone(&candidate))
            }
        });
        stored
    }
}
