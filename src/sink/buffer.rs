//! Keyframe-aware bounded chunk buffer.
//!
//! Whatever is dropped, the buffer front stays decodable given what has
//! already been transmitted: it is either a keyframe or a continuation of the
//! GOP currently on the wire.

use std::collections::VecDeque;

use tracing::debug;

use crate::encode::EncodedChunk;

/// Drops per cause, also exported as `sink_chunks_dropped_total{reason}`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DropCounts {
    /// Evicted to make room in a full buffer.
    pub overflow: u64,
    /// Rejected while waiting for a keyframe to resume from.
    pub awaiting_keyframe: u64,
    /// Removed after a write error left the GOP incomplete downstream.
    pub resync: u64,
}

impl DropCounts {
    pub fn total(&self) -> u64 {
        self.overflow + self.awaiting_keyframe + self.resync
    }
}

#[derive(Debug)]
pub struct ChunkBuffer {
    queue: VecDeque<EncodedChunk>,
    capacity: usize,
    awaiting_keyframe: bool,
    dropped: DropCounts,
}

fn record_drop(reason: &'static str, n: usize) {
    if n > 0 {
        metrics::counter!("sink_chunks_dropped_total", "reason" => reason).increment(n as u64);
    }
}

impl ChunkBuffer {
    /// Starts out waiting for a keyframe, so a stream never opens mid-GOP.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            awaiting_keyframe: true,
            dropped: DropCounts::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_awaiting_keyframe(&self) -> bool {
        self.awaiting_keyframe
    }

    pub fn dropped(&self) -> DropCounts {
        self.dropped
    }

    pub fn pop(&mut self) -> Option<EncodedChunk> {
        self.queue.pop_front()
    }

    /// Sequence numbers currently buffered, oldest first.
    pub fn sequences(&self) -> Vec<u64> {
        self.queue.iter().map(|c| c.sequence).collect()
    }

    pub fn push(&mut self, chunk: EncodedChunk) {
        if self.queue.len() >= self.capacity {
            self.make_room();
        }
        if self.awaiting_keyframe {
            if !chunk.is_keyframe {
                self.dropped.awaiting_keyframe += 1;
                record_drop("awaiting_keyframe", 1);
                return;
            }
            debug!(sequence = chunk.sequence, "keyframe received, resuming");
            self.awaiting_keyframe = false;
        }
        self.queue.push_back(chunk);
    }

    /// Evict one run of dependent chunks.
    ///
    /// Prefers the non-keyframes between the front and the next buffered
    /// keyframe. A front keyframe that is directly followed by another one is
    /// evicted on its own. Without any later keyframe the whole buffer goes and
    /// the stream resumes at the next keyframe.
    fn make_room(&mut self) {
        let next_key = self
            .queue
            .iter()
            .skip(1)
            .position(|c| c.is_keyframe)
            .map(|i| i + 1);

        let evicted = match next_key {
            Some(key) => {
                let start = match self.queue.front() {
                    Some(front) if front.is_keyframe => 1,
                    _ => 0,
                };
                if start < key {
                    self.queue.drain(start..key).count()
                } else {
                    self.queue.pop_front().map_or(0, |_| 1)
                }
            }
            None => {
                let n = self.queue.len();
                self.queue.clear();
                self.awaiting_keyframe = true;
                n
            }
        };
        debug!(evicted, "sink buffer full");
        self.dropped.overflow += evicted as u64;
        record_drop("overflow", evicted);
    }

    /// After a failed write: the chunk that failed is gone, so drop the rest
    /// of its GOP. Returns the number of chunks removed.
    pub fn resync(&mut self) -> usize {
        let mut removed = 0;
        while self.queue.front().is_some_and(|c| !c.is_keyframe) {
            self.queue.pop_front();
            removed += 1;
        }
        if self.queue.is_empty() {
            self.awaiting_keyframe = true;
        }
        self.dropped.resync += removed as u64;
        record_drop("resync", removed);
        removed
    }

    /// Empty the buffer, returning how many chunks were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        n
    }
}
