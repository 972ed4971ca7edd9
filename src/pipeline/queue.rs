//! Bounded inter-stage queues that keep the newest items.
//!
//! A full queue evicts its oldest entry to admit the new one. The producer
//! holds its own receiver handle on the flume channel for the eviction, so
//! the consumer side is a plain receiver.

use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::trace;

use crate::pipeline::stats::Counter;

/// Sending half. Dropping it disconnects the queue once it is drained.
pub struct QueueProducer<T> {
    tx: Sender<T>,
    evict: Receiver<T>,
    name: &'static str,
    dropped: Arc<Counter>,
}

pub struct QueueConsumer<T> {
    rx: Receiver<T>,
    dropped: Arc<Counter>,
}

/// The consumer went away; the rejected item is handed back.
#[derive(Debug)]
pub struct Closed<T>(pub T);

pub fn latest_queue<T>(name: &'static str, capacity: usize) -> (QueueProducer<T>, QueueConsumer<T>) {
    let (tx, rx) = flume::bounded(capacity.max(1));
    let dropped = Arc::new(Counter::default());
    (
        QueueProducer {
            tx,
            evict: rx.clone(),
            name,
            dropped: Arc::clone(&dropped),
        },
        QueueConsumer { rx, dropped },
    )
}

impl<T> QueueProducer<T> {
    /// Enqueue without blocking, evicting the oldest item if full.
    pub fn push(&self, item: T) -> Result<(), Closed<T>> {
        // One receiver handle is our own eviction handle.
        if self.tx.receiver_count() <= 1 {
            return Err(Closed(item));
        }
        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    if self.evict.try_recv().is_ok() {
                        self.dropped.incr();
                        metrics::counter!("queue_dropped_total", "queue" => self.name).increment(1);
                        trace!(queue = self.name, "queue full, dropped oldest");
                    }
                    item = back;
                }
                Err(TrySendError::Disconnected(back)) => return Err(Closed(back)),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }
}

impl<T> QueueConsumer<T> {
    /// Next item, or `None` once the producer is gone and the queue is empty.
    pub async fn recv_async(&self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// `Ok(None)` on timeout, `Err(())` once disconnected and drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>, ()> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(()),
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }

    /// Shared handle on the eviction count, readable after the queue is gone.
    pub fn drop_counter(&self) -> Arc<Counter> {
        Arc::clone(&self.dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameStamper, PixelFormat};
    use bytes::Bytes;

    #[test]
    fn full_queue_keeps_most_recent() {
        let (tx, rx) = latest_queue("capture", 2);
        let mut stamper = FrameStamper::new();
        for _ in 0..5 {
            let frame = stamper.rgb_frame(Bytes::from_static(&[0; 12]), 2, 2, PixelFormat::Rgb24, None);
            tx.push(frame).unwrap();
        }

        assert_eq!(rx.len(), 2);
        assert_eq!(rx.dropped(), 3);
        let kept: Vec<u64> = std::iter::from_fn(|| rx.try_recv()).map(|f| f.sequence()).collect();
        assert_eq!(kept, vec![3, 4]);
    }

    #[test]
    fn dropping_producer_disconnects_after_drain() {
        let (tx, rx) = latest_queue("encode", 4);
        tx.push(1u32).unwrap();
        drop(tx);
        assert_eq!(rx.recv(), Some(1));
        assert_eq!(rx.recv(), None);
        assert!(rx.recv_timeout(Duration::from_millis(5)).is_err());
    }

    #[test]
    fn push_fails_once_consumer_is_gone() {
        let (tx, rx) = latest_queue("encode", 4);
        drop(rx);
        assert!(matches!(tx.push(7u8), Err(Closed(7))));
    }
}
