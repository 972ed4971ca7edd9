//! Stage wiring and supervision.
//!
//! ```text
//! capture thread -> [latest queue] -> detect+overlay task -> [latest queue]
//!     -> encode thread -> StreamSink buffer -> sink worker -> network
//! ```
//!
//! A graceful stop only stops capture. Each stage exits when its input
//! queue disconnects, so in-flight frames drain through detection, overlay
//! and encoding before the sink flushes and closes. A fatal error aborts
//! every stage instead.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{self, Frame, FrameSource};
use crate::config::PipelineConfig;
use crate::detect::{self, DetectionCache, DetectionScheduler, Detector};
use crate::encode::{self, CodecBackend, EncoderSettings, H264Encoder};
use crate::error::PipelineError;
use crate::overlay::{AnnotatedFrame, OverlayCompositor, StatusLine};
use crate::pipeline::queue::{latest_queue, QueueConsumer, QueueProducer};
use crate::pipeline::shutdown::Shutdown;
use crate::pipeline::stats::{Counter, FpsMeter};
use crate::sink::{Connector, SinkSnapshot, StreamSink, TcpConnector};

const STATUS_PERIOD: Duration = Duration::from_secs(1);
const ENCODE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct StageStats {
    captured: Counter,
    forwarded: Counter,
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub elapsed: Duration,
    pub frames_captured: u64,
    /// Frames that went through detection and overlay.
    pub frames_forwarded: u64,
    pub frames_encoded: u64,
    pub capture_queue_dropped: u64,
    pub encode_queue_dropped: u64,
    pub detections_submitted: u64,
    pub detections_skipped: u64,
    pub detections_published: u64,
    pub detection_failures: u64,
    pub detection_timeouts: u64,
    pub chunks: u64,
    pub keyframes: u64,
    pub encoded_bytes: u64,
    pub discontinuities: u64,
    pub sink: SinkSnapshot,
}

impl PipelineReport {
    pub fn log(&self) {
        info!(
            elapsed = ?self.elapsed,
            captured = self.frames_captured,
            forwarded = self.frames_forwarded,
            encoded = self.frames_encoded,
            queue_drops = self.capture_queue_dropped + self.encode_queue_dropped,
            detections = self.detections_published,
            detection_failures = self.detection_failures + self.detection_timeouts,
            keyframes = self.keyframes,
            sent_chunks = self.sink.sent_chunks,
            sink_drops = self.sink.dropped_total(),
            reconnects = self.sink.reconnects,
            "Pipeline finished"
        );
    }
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    source: Box<dyn FrameSource>,
    detector: Arc<dyn Detector>,
    encoder: H264Encoder,
    connector: Arc<dyn Connector>,
}

impl Pipeline {
    /// Open every component the configuration names.
    ///
    /// Capture device, detector model and encoder are all opened here, so a
    /// pipeline that constructs successfully only has runtime failures left.
    #[instrument(skip_all, name = "pipeline_setup")]
    pub fn new(config: Arc<PipelineConfig>) -> Result<Self, PipelineError> {
        config.validate()?;
        let capture = &config.capture;
        let source = capture::open_source(capture)?;
        let detector = detect::from_config(&config.detection, capture.width, capture.height)?;
        let codec = encode::open_backend(config.encoder.backend, EncoderSettings::from_config(&config))?;
        let connector = Arc::new(TcpConnector::new(
            config.sink_address(),
            Duration::from_millis(config.sink.connect_timeout_ms),
        ));
        Self::with_parts(config, source, detector, codec, connector)
    }

    /// Assemble a pipeline from already-built parts.
    pub fn with_parts(
        config: Arc<PipelineConfig>,
        source: Box<dyn FrameSource>,
        detector: Arc<dyn Detector>,
        codec: Box<dyn CodecBackend>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, PipelineError> {
        let encoder = H264Encoder::new(EncoderSettings::from_config(&config), codec)?;
        Ok(Self {
            config,
            source,
            detector,
            encoder,
            connector,
        })
    }

    pub fn config(&self) -> &Arc<PipelineConfig> {
        &self.config
    }

    /// Run until the source is exhausted, `shutdown` is requested, or a stage
    /// fails fatally.
    pub async fn run(self, shutdown: Shutdown) -> Result<PipelineReport, PipelineError> {
        let Self {
            config,
            mut source,
            detector,
            encoder,
            connector,
        } = self;
        let started = Instant::now();

        source.start()?;
        info!("Capturing from {}", source.describe());

        let runtime = Handle::current();
        let stats = Arc::new(StageStats::default());
        let (fatal_tx, fatal_rx) = flume::unbounded::<PipelineError>();
        let (capture_tx, capture_rx) = latest_queue::<Frame>("capture", config.queues.capture_capacity);
        let (encode_tx, encode_rx) = latest_queue::<AnnotatedFrame>("encode", config.queues.encode_capacity);

        let (sink, mut sink_worker) = StreamSink::spawn(&config.sink, connector, &runtime);

        let cache = Arc::new(DetectionCache::new());
        let scheduler = DetectionScheduler::new(detector, Arc::clone(&cache), &config.detection, runtime.clone());
        let detection_stats = scheduler.stats();
        let encoder_stats = encoder.stats();

        let capture_thread = spawn_capture(
            source,
            capture_tx,
            config.capture.pin_core,
            Arc::clone(&stats),
            shutdown.clone(),
            fatal_tx.clone(),
        )?;

        let capture_drops = capture_rx.drop_counter();
        let encode_drops = encode_rx.drop_counter();
        let forwarder = Forwarder {
            scheduler,
            compositor: OverlayCompositor::for_height(config.capture.height),
            show_status: config.overlay.show_status,
            stats: Arc::clone(&stats),
            shutdown: shutdown.clone(),
            settle_limit: Duration::from_millis(config.detection.inference_timeout_ms),
        };
        let forward = tokio::spawn(forwarder.run(capture_rx, encode_tx));

        let encode_thread = spawn_encode(
            encoder,
            encode_rx,
            sink.clone(),
            config.encoder.max_consecutive_failures,
            shutdown.clone(),
            fatal_tx,
        )?;

        let status = tokio::spawn(report_status(Arc::clone(&stats), Arc::clone(&cache), sink.clone()));

        // Encoding is the last threaded stage, so it finishing means the
        // chain has drained or aborted.
        let encode_joined = tokio::task::spawn_blocking(move || encode_thread.join()).await;
        let capture_joined = tokio::task::spawn_blocking(move || capture_thread.join()).await;
        let forward_joined = forward.await;
        status.abort();

        let mut failure = fatal_rx.try_recv().ok();
        for (stage, joined) in [("encode", encode_joined), ("capture", capture_joined)] {
            if !matches!(joined, Ok(Ok(()))) {
                failure.get_or_insert_with(|| PipelineError::stage(stage, "thread panicked"));
            }
        }
        if let Err(e) = forward_joined {
            failure.get_or_insert_with(|| PipelineError::stage("forward", e.to_string()));
        }

        if failure.is_some() || shutdown.is_aborted() {
            sink_worker.abort();
        } else {
            sink.close();
            let limit = Duration::from_millis(config.sink.flush_timeout_ms) + Duration::from_secs(1);
            if tokio::time::timeout(limit, &mut sink_worker).await.is_err() {
                warn!("stream sink did not close in time, dropping the connection");
                sink_worker.abort();
            }
        }

        if let Some(e) = failure {
            error!("Pipeline failed: {}", e);
            return Err(e);
        }

        let report = PipelineReport {
            elapsed: started.elapsed(),
            frames_captured: stats.captured.get(),
            frames_forwarded: stats.forwarded.get(),
            frames_encoded: encoder_stats.frames.get(),
            capture_queue_dropped: capture_drops.get(),
            encode_queue_dropped: encode_drops.get(),
            detections_submitted: detection_stats.submitted.get(),
            detections_skipped: detection_stats.skipped.get(),
            detections_published: detection_stats.published.get(),
            detection_failures: detection_stats.failed.get(),
            detection_timeouts: detection_stats.timed_out.get(),
            chunks: encoder_stats.chunks.get(),
            keyframes: encoder_stats.keyframes.get(),
            encoded_bytes: encoder_stats.bytes.get(),
            discontinuities: encoder_stats.discontinuities.get(),
            sink: sink.snapshot(),
        };
        report.log();
        Ok(report)
    }
}

fn spawn_capture(
    mut source: Box<dyn FrameSource>,
    queue: QueueProducer<Frame>,
    pin_core: Option<usize>,
    stats: Arc<StageStats>,
    shutdown: Shutdown,
    fatal: flume::Sender<PipelineError>,
) -> Result<JoinHandle<()>, PipelineError> {
    std::thread::Builder::new()
        .name("argus-capture".into())
        .spawn(move || {
            if let Some(id) = pin_core {
                if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                    warn!(core = id, "failed to pin capture thread");
                }
            }

            while !shutdown.is_stopping() {
                match source.next() {
                    Ok(frame) => {
                        stats.captured.incr();
                        metrics::counter!("capture_frames_total").increment(1);
                        if queue.push(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) if !e.is_fatal() => {
                        info!("{}, draining", e);
                        break;
                    }
                    Err(e) => {
                        error!("Capture failed: {}", e);
                        let _ = fatal.send(e.into());
                        shutdown.abort();
                        break;
                    }
                }
            }
            source.stop();
            debug!("capture stopped");
        })
        .map_err(|e| PipelineError::stage("capture", e.to_string()))
}

/// Detection scheduling and overlay, in capture order.
struct Forwarder {
    scheduler: DetectionScheduler,
    compositor: OverlayCompositor,
    show_status: bool,
    stats: Arc<StageStats>,
    shutdown: Shutdown,
    settle_limit: Duration,
}

impl Forwarder {
    async fn run(self, input: QueueConsumer<Frame>, output: QueueProducer<AnnotatedFrame>) {
        let mut fps = FpsMeter::default();
        while let Some(frame) = input.recv_async().await {
            if self.shutdown.is_aborted() {
                break;
            }
            self.scheduler.observe(&frame);
            let snapshot = self.scheduler.cache().load();
            let rate = fps.tick();
            let status = self.show_status.then(|| StatusLine {
                fps: rate,
                detections: snapshot.as_ref().map_or(0, |d| d.len()),
            });
            let annotated = self
                .compositor
                .compose_with_status(&frame, snapshot.as_ref(), status.as_ref());
            self.stats.forwarded.incr();
            if output.push(annotated).is_err() {
                break;
            }
        }
        drop(output);

        if !self.shutdown.is_aborted() && !self.scheduler.settle(self.settle_limit).await {
            debug!("inference still running at shutdown");
        }
    }
}

fn spawn_encode(
    mut encoder: H264Encoder,
    input: QueueConsumer<AnnotatedFrame>,
    sink: StreamSink,
    max_failures: u32,
    shutdown: Shutdown,
    fatal: flume::Sender<PipelineError>,
) -> Result<JoinHandle<()>, PipelineError> {
    std::thread::Builder::new()
        .name("argus-encode".into())
        .spawn(move || {
            let mut consecutive_failures = 0u32;
            loop {
                let frame = match input.recv_timeout(ENCODE_POLL) {
                    Ok(Some(frame)) => frame,
                    Ok(None) if shutdown.is_aborted() => return,
                    Ok(None) => continue,
                    Err(()) => break,
                };
                if shutdown.is_aborted() {
                    return;
                }
                let sequence = frame.sequence;
                match encoder.encode(frame) {
                    Ok(chunks) => {
                        consecutive_failures = 0;
                        chunks.into_iter().for_each(|c| sink.send(c));
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(sequence, consecutive_failures, "encode failed: {}", e);
                        if consecutive_failures >= max_failures.max(1) {
                            error!("Encoder failed {} times in a row", consecutive_failures);
                            let _ = fatal.send(e.into());
                            shutdown.abort();
                            return;
                        }
                    }
                }
            }

            match encoder.flush() {
                Ok(chunks) => chunks.into_iter().for_each(|c| sink.send(c)),
                Err(e) => warn!("encoder flush failed: {}", e),
            }
            debug!("encoder drained");
        })
        .map_err(|e| PipelineError::stage("encode", e.to_string()))
}

async fn report_status(stats: Arc<StageStats>, cache: Arc<DetectionCache>, sink: StreamSink) {
    let mut ticker = tokio::time::interval(STATUS_PERIOD);
    ticker.tick().await;
    let mut last = stats.forwarded.get();
    loop {
        ticker.tick().await;
        let forwarded = stats.forwarded.get();
        let snap = sink.snapshot();
        info!(
            fps = forwarded - last,
            detections = cache.load().map_or(0, |d| d.len()),
            frames = forwarded,
            connected = snap.connected,
            buffered = snap.buffered,
            "Streaming"
        );
        last = forwarded;
    }
}
