//! Outbound H.264 stream.
//!
//! [`StreamSink::send`] never touches the socket: it appends to the shared
//! [`ChunkBuffer`] and wakes the worker task, which owns the connection and
//! runs the Disconnected / Connected state machine.

pub mod backoff;
pub mod buffer;
pub mod connector;

pub use backoff::Backoff;
pub use buffer::{ChunkBuffer, DropCounts};
pub use connector::{BoxedStream, Connector, SinkStream, TcpConnector};

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SinkConfig;
use crate::encode::EncodedChunk;
use crate::pipeline::stats::Counter;

#[derive(Debug, Default)]
pub struct SinkStats {
    pub sent_chunks: Counter,
    pub sent_bytes: Counter,
    /// Successful connections after the first one.
    pub reconnects: Counter,
    pub connect_failures: Counter,
    /// In-flight chunks lost to a write error or write timeout.
    pub write_errors: Counter,
    /// Chunks still buffered when the shutdown flush ran out of time.
    pub abandoned: Counter,
}

/// Point-in-time view of the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkSnapshot {
    pub sent_chunks: u64,
    pub sent_bytes: u64,
    pub reconnects: u64,
    pub connect_failures: u64,
    pub write_errors: u64,
    pub abandoned: u64,
    pub dropped: DropCounts,
    pub buffered: usize,
    pub connected: bool,
}

impl SinkSnapshot {
    pub fn dropped_total(&self) -> u64 {
        self.dropped.total() + self.write_errors + self.abandoned
    }
}

struct Shared {
    buffer: Mutex<ChunkBuffer>,
    data: Notify,
    /// Flush deadline, set once by [`StreamSink::close`].
    closed: watch::Sender<Option<Instant>>,
    flush_timeout: Duration,
    connected: AtomicBool,
    stats: SinkStats,
}

impl Shared {
    fn buffer(&self) -> MutexGuard<'_, ChunkBuffer> {
        // A panic elsewhere cannot leave the queue half-updated.
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        metrics::gauge!("sink_connected").set(if connected { 1.0 } else { 0.0 });
    }
}

/// Handle to the sink. Cheap to clone; all clones feed the same connection.
#[derive(Clone)]
pub struct StreamSink {
    shared: Arc<Shared>,
}

impl StreamSink {
    /// Start the connection worker on `runtime`. The sink is usable
    /// immediately; chunks are buffered until the first connection succeeds.
    pub fn spawn(config: &SinkConfig, connector: Arc<dyn Connector>, runtime: &Handle) -> (Self, JoinHandle<()>) {
        let (closed, closed_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            buffer: Mutex::new(ChunkBuffer::new(config.buffer_capacity)),
            data: Notify::new(),
            closed,
            flush_timeout: Duration::from_millis(config.flush_timeout_ms),
            connected: AtomicBool::new(false),
            stats: SinkStats::default(),
        });
        let worker = Worker {
            shared: Arc::clone(&shared),
            connector,
            closed: closed_rx,
            backoff: Backoff::new(
                Duration::from_millis(config.initial_backoff_ms),
                Duration::from_millis(config.max_backoff_ms),
            ),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            connected_before: false,
        };
        let handle = runtime.spawn(worker.run());
        (Self { shared }, handle)
    }

    /// Queue a chunk for transmission. Never blocks on the network.
    pub fn send(&self, chunk: EncodedChunk) {
        self.shared.buffer().push(chunk);
        self.shared.data.notify_one();
    }

    /// Flush what is buffered, then close the connection.
    ///
    /// Everything after the first call, including a write already in
    /// progress, has `flush_timeout_ms` to finish.
    pub fn close(&self) {
        let deadline = Instant::now() + self.shared.flush_timeout;
        self.shared.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(deadline);
            true
        });
        self.shared.data.notify_one();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> SinkSnapshot {
        let (dropped, buffered) = {
            let buffer = self.shared.buffer();
            (buffer.dropped(), buffer.len())
        };
        let stats = &self.shared.stats;
        SinkSnapshot {
            sent_chunks: stats.sent_chunks.get(),
            sent_bytes: stats.sent_bytes.get(),
            reconnects: stats.reconnects.get(),
            connect_failures: stats.connect_failures.get(),
            write_errors: stats.write_errors.get(),
            abandoned: stats.abandoned.get(),
            dropped,
            buffered,
            connected: self.is_connected(),
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    closed: watch::Receiver<Option<Instant>>,
    backoff: Backoff,
    write_timeout: Duration,
    connected_before: bool,
}

/// Resolves with the flush deadline once the sink is closed.
async fn wait_closed(closed: &mut watch::Receiver<Option<Instant>>) -> Instant {
    match closed.wait_for(Option::is_some).await {
        Ok(deadline) => (*deadline).unwrap_or_else(Instant::now),
        Err(_) => Instant::now(),
    }
}

impl Worker {
    fn close_deadline(&self) -> Option<Instant> {
        *self.closed.borrow()
    }

    fn is_closed(&self) -> bool {
        self.close_deadline().is_some()
    }

    async fn run(mut self) {
        let target = self.connector.describe();
        info!("Stream sink started for {}", target);

        let mut stream: Option<BoxedStream> = None;
        while !self.is_closed() {
            stream = match stream.take() {
                None => self.connect_or_wait(&target).await,
                Some(s) => self.pump(s).await,
            };
        }

        let pending = self.shared.buffer().len();
        debug!(pending, "flushing stream sink");
        let deadline = self.close_deadline().unwrap_or_else(Instant::now);
        if tokio::time::timeout_at(deadline, self.drain(&mut stream, &target))
            .await
            .is_err()
        {
            let abandoned = self.shared.buffer().clear();
            self.shared.stats.abandoned.add(abandoned as u64);
            metrics::counter!("sink_chunks_dropped_total", "reason" => "shutdown").increment(abandoned as u64);
            warn!(abandoned, flush_timeout = ?self.shared.flush_timeout, "sink flush timed out");
        }

        if let Some(mut s) = stream {
            match tokio::time::timeout(self.write_timeout, s.shutdown()).await {
                Ok(Err(e)) => debug!("stream shutdown: {}", e),
                Err(_) => debug!("stream shutdown timed out"),
                Ok(Ok(())) => {}
            }
        }
        self.shared.set_connected(false);
        info!("Stream sink closed");
    }

    async fn connect(&mut self, target: &str) -> Option<BoxedStream> {
        match self.connector.connect().await {
            Ok(stream) => {
                if self.connected_before {
                    self.shared.stats.reconnects.incr();
                    metrics::counter!("sink_reconnects_total").increment(1);
                    info!("Reconnected to {}", target);
                } else {
                    info!("Connected to {}", target);
                }
                self.connected_before = true;
                self.backoff.reset();
                self.shared.set_connected(true);
                Some(stream)
            }
            Err(e) => {
                self.shared.stats.connect_failures.incr();
                let delay = self.backoff.next_delay();
                warn!(retry_in = ?delay, "connect to {} failed: {}", target, e);
                tokio::time::sleep(delay).await;
                None
            }
        }
    }

    /// Disconnected state: one attempt, backing off on failure. Returns early
    /// when the sink is closed.
    async fn connect_or_wait(&mut self, target: &str) -> Option<BoxedStream> {
        let mut closed = self.closed.clone();
        tokio::select! {
            stream = self.connect(target) => stream,
            _ = wait_closed(&mut closed) => None,
        }
    }

    /// Connected state: write the next chunk, or wait for one.
    async fn pump(&mut self, mut stream: BoxedStream) -> Option<BoxedStream> {
        let chunk = loop {
            let notified = self.shared.data.notified();
            if let Some(chunk) = self.shared.buffer().pop() {
                break chunk;
            }
            if self.is_closed() {
                return Some(stream);
            }
            tokio::select! {
                _ = notified => {}
                _ = wait_closed(&mut self.closed) => {}
            }
        };

        // A close during a stalled write still has to meet the flush deadline.
        let mut closed = self.closed.clone();
        let flush_expired = async move {
            let deadline = wait_closed(&mut closed).await;
            tokio::time::sleep_until(deadline).await;
        };
        let written = tokio::select! {
            res = self.write(&mut stream, &chunk) => res,
            _ = flush_expired => Err(io::Error::new(io::ErrorKind::TimedOut, "flush deadline passed mid-write")),
        };

        match written {
            Ok(()) => Some(stream),
            Err(e) => {
                self.on_write_error(&chunk, e);
                None
            }
        }
    }

    /// Write one chunk within `write_timeout`; a peer that stops reading
    /// surfaces as `TimedOut`.
    async fn write(&self, stream: &mut BoxedStream, chunk: &EncodedChunk) -> io::Result<()> {
        let send = async {
            stream.write_all(&chunk.data).await?;
            stream.flush().await
        };
        tokio::time::timeout(self.write_timeout, send)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))??;

        let stats = &self.shared.stats;
        stats.sent_chunks.incr();
        stats.sent_bytes.add(chunk.data.len() as u64);
        metrics::counter!("sink_chunks_sent_total").increment(1);
        metrics::counter!("sink_bytes_sent_total").increment(chunk.data.len() as u64);
        Ok(())
    }

    fn on_write_error(&self, chunk: &EncodedChunk, e: io::Error) {
        let skipped = self.shared.buffer().resync();
        self.shared.stats.write_errors.incr();
        metrics::counter!("sink_chunks_dropped_total", "reason" => "write_error").increment(1);
        self.shared.set_connected(false);
        warn!(
            sequence = chunk.sequence,
            skipped, "write failed, reconnecting at next keyframe: {}", e
        );
    }

    /// Send everything still buffered, reconnecting if needed.
    async fn drain(&mut self, stream: &mut Option<BoxedStream>, target: &str) {
        loop {
            let Some(mut s) = stream.take() else {
                if self.shared.buffer().is_empty() {
                    return;
                }
                *stream = self.connect(target).await;
                continue;
            };
            let Some(chunk) = self.shared.buffer().pop() else {
                *stream = Some(s);
                return;
            };
            match self.write(&mut s, &chunk).await {
                Ok(()) => *stream = Some(s),
                Err(e) => self.on_write_error(&chunk, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::AsyncWrite;

    const CHUNK_LEN: usize = 9;

    fn chunk(sequence: u64, key_every: u64) -> EncodedChunk {
        let is_keyframe = sequence % key_every == 0;
        let mut data = sequence.to_be_bytes().to_vec();
        data.push(is_keyframe as u8);
        EncodedChunk {
            data: Bytes::from(data),
            is_keyframe,
            sequence,
        }
    }

    /// In-memory stream accepting at most 4 bytes per write, optionally
    /// failing once a byte budget is used up. A stalled stream never
    /// accepts a byte, like a peer that stopped reading.
    struct MockStream {
        wire: Arc<Mutex<Vec<u8>>>,
        fail_after: Option<usize>,
        stalled: bool,
    }

    impl AsyncWrite for MockStream {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            if self.stalled {
                return Poll::Pending;
            }
            let mut wire = self.wire.lock().unwrap();
            if self.fail_after.is_some_and(|limit| wire.len() >= limit) {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected")));
            }
            let n = buf.len().min(4);
            wire.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Stall {
        Never,
        First,
        Always,
    }

    /// Hands out one recorded wire per connection; the first fails after
    /// `fail_after` bytes.
    struct MockConnector {
        wires: Mutex<Vec<Arc<Mutex<Vec<u8>>>>>,
        fail_after: Option<usize>,
        refuse_first: usize,
        stall: Stall,
        attempts: Mutex<usize>,
    }

    impl MockConnector {
        fn new(fail_after: Option<usize>, refuse_first: usize) -> Arc<Self> {
            Arc::new(Self {
                wires: Mutex::new(Vec::new()),
                fail_after,
                refuse_first,
                stall: Stall::Never,
                attempts: Mutex::new(0),
            })
        }

        fn stalling(stall: Stall) -> Arc<Self> {
            Arc::new(Self {
                wires: Mutex::new(Vec::new()),
                fail_after: None,
                refuse_first: 0,
                stall,
                attempts: Mutex::new(0),
            })
        }

        fn sequences(&self) -> Vec<Vec<u64>> {
            self.wires
                .lock()
                .unwrap()
                .iter()
                .map(|w| {
                    w.lock()
                        .unwrap()
                        .chunks_exact(CHUNK_LEN)
                        .map(|c| u64::from_be_bytes(c[..8].try_into().unwrap()))
                        .collect()
                })
                .collect()
        }
    }

    impl Connector for MockConnector {
        fn describe(&self) -> String {
            "mock".into()
        }

        fn connect(&self) -> connector::ConnectFuture<'_> {
            Box::pin(async move {
                let attempt = {
                    let mut a = self.attempts.lock().unwrap();
                    *a += 1;
                    *a
                };
                if attempt <= self.refuse_first {
                    return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "not yet"));
                }
                let mut wires = self.wires.lock().unwrap();
                let wire = Arc::new(Mutex::new(Vec::new()));
                let first = wires.is_empty();
                let fail_after = if first { self.fail_after } else { None };
                let stalled = self.stall == Stall::Always || (first && self.stall == Stall::First);
                wires.push(Arc::clone(&wire));
                Ok(Box::new(MockStream {
                    wire,
                    fail_after,
                    stalled,
                }) as BoxedStream)
            })
        }
    }

    fn config(buffer_capacity: usize) -> SinkConfig {
        SinkConfig {
            buffer_capacity,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            write_timeout_ms: 2_000,
            flush_timeout_ms: 2_000,
            ..SinkConfig::default()
        }
    }

    #[tokio::test]
    async fn write_error_resumes_at_next_keyframe() {
        // Keyframes every 30; the first connection breaks once chunks 0..=50
        // are on the wire, so 51 fails mid-flight.
        let connector = MockConnector::new(Some(51 * CHUNK_LEN), 0);
        let (sink, worker) = StreamSink::spawn(&config(128), connector.clone(), &Handle::current());
        for seq in 0..100 {
            sink.send(chunk(seq, 30));
        }
        sink.close();
        worker.await.unwrap();

        let wires = connector.sequences();
        assert_eq!(wires.len(), 2);
        assert_eq!(wires[0], (0..=50).collect::<Vec<_>>());
        assert_eq!(wires[1], (60..100).collect::<Vec<_>>());

        let snap = sink.snapshot();
        assert_eq!(snap.write_errors, 1);
        assert_eq!(snap.dropped.resync, 8);
        assert_eq!(snap.reconnects, 1);
        assert_eq!(snap.sent_chunks, 91);
    }

    #[tokio::test]
    async fn buffers_while_disconnected() {
        let connector = MockConnector::new(None, 3);
        let (sink, worker) = StreamSink::spawn(&config(8), connector.clone(), &Handle::current());
        for seq in 0..20 {
            sink.send(chunk(seq, 5));
        }
        assert!(!sink.is_connected());
        sink.close();
        worker.await.unwrap();

        let wires = connector.sequences();
        assert_eq!(wires.len(), 1);
        // Whatever survived overflow starts at a keyframe.
        assert_eq!(wires[0].first().map(|s| s % 5), Some(0));
        assert_eq!(wires[0].last(), Some(&19));
        let snap = sink.snapshot();
        assert_eq!(snap.connect_failures, 3);
        assert_eq!(snap.reconnects, 0);
        assert!(snap.dropped.overflow > 0);
    }

    #[tokio::test]
    async fn stalled_peer_times_out_and_reconnects() {
        let connector = MockConnector::stalling(Stall::First);
        let config = SinkConfig {
            write_timeout_ms: 50,
            ..config(128)
        };
        let (sink, worker) = StreamSink::spawn(&config, connector.clone(), &Handle::current());
        for seq in 0..20 {
            sink.send(chunk(seq, 5));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        sink.close();
        worker.await.unwrap();

        let wires = connector.sequences();
        assert_eq!(wires.len(), 2);
        assert!(wires[0].is_empty());
        assert_eq!(wires[1], (5..20).collect::<Vec<_>>());

        let snap = sink.snapshot();
        assert_eq!(snap.write_errors, 1);
        assert_eq!(snap.dropped.resync, 4);
        assert_eq!(snap.reconnects, 1);
        assert_eq!(snap.sent_chunks, 15);
    }

    #[tokio::test]
    async fn close_is_bounded_when_peer_never_reads() {
        let connector = MockConnector::stalling(Stall::Always);
        let config = SinkConfig {
            write_timeout_ms: 60_000,
            flush_timeout_ms: 200,
            ..config(128)
        };
        let (sink, worker) = StreamSink::spawn(&config, connector, &Handle::current());
        for seq in 0..20 {
            sink.send(chunk(seq, 5));
        }
        // Let the worker get stuck writing chunk 0.
        tokio::time::sleep(Duration::from_millis(50)).await;
        sink.close();

        tokio::time::timeout(Duration::from_secs(3), worker)
            .await
            .expect("worker outlived the flush deadline")
            .unwrap();

        let snap = sink.snapshot();
        assert!(!snap.connected);
        assert_eq!(snap.sent_chunks, 0);
        assert_eq!(snap.buffered, 0);
        assert!(snap.write_errors >= 1);
        assert!(snap.abandoned > 0);
    }

    #[tokio::test]
    async fn repeated_close_keeps_the_first_deadline() {
        let connector = MockConnector::stalling(Stall::Always);
        let config = SinkConfig {
            write_timeout_ms: 60_000,
            flush_timeout_ms: 300,
            ..config(16)
        };
        let (sink, mut worker) = StreamSink::spawn(&config, connector, &Handle::current());
        sink.send(chunk(0, 5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        sink.close();
        let started = Instant::now();
        // Later calls must not push the deadline out.
        loop {
            tokio::select! {
                res = &mut worker => {
                    res.unwrap();
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => sink.close(),
            }
        }
        assert!(started.elapsed() < Duration::from_millis(1_000), "{:?}", started.elapsed());
    }
}
