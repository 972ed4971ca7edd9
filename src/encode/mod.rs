//! H.264 encoding stage.
//!
//! [`H264Encoder`] owns the inter-frame state that the bitstream depends on:
//! the last input sequence, frames since the last keyframe, and any bitrate
//! change waiting for the next GOP. The actual compression sits behind
//! [`CodecBackend`].

pub mod backend;
pub mod nal;
pub mod rate;
pub mod synthetic;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_x264;

pub use backend::{CodecBackend, CodedUnit, EncoderSettings};
pub use synthetic::SyntheticBackend;

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::EncoderKind;
use crate::error::EncoderError;
use crate::overlay::AnnotatedFrame;
use crate::pipeline::stats::Counter;
use rate::RateMeter;

/// Encoded access unit handed to the sink.
#[derive(Clone)]
pub struct EncodedChunk {
    pub data: Bytes,
    pub is_keyframe: bool,
    pub sequence: u64,
}

impl std::fmt::Debug for EncodedChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedChunk")
            .field("sequence", &self.sequence)
            .field("is_keyframe", &self.is_keyframe)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct EncoderStats {
    pub frames: Counter,
    pub chunks: Counter,
    pub keyframes: Counter,
    pub bytes: Counter,
    /// Input gaps that forced a fresh keyframe.
    pub discontinuities: Counter,
    /// Frames at or behind the last encoded sequence, never encoded.
    pub stale: Counter,
    pub failures: Counter,
}

/// Open the configured codec backend.
pub fn open_backend(kind: EncoderKind, settings: EncoderSettings) -> Result<Box<dyn CodecBackend>, EncoderError> {
    match kind {
        EncoderKind::Synthetic => Ok(Box::new(SyntheticBackend::open(settings)?)),
        #[cfg(feature = "gstreamer-pipeline")]
        EncoderKind::X264 => Ok(Box::new(gst_x264::X264Backend::open(settings)?)),
        #[cfg(not(feature = "gstreamer-pipeline"))]
        EncoderKind::X264 => Err(EncoderError::Init(
            "x264 encoder requested but the gstreamer-pipeline feature is disabled".into(),
        )),
    }
}

pub struct H264Encoder {
    backend: Box<dyn CodecBackend>,
    settings: EncoderSettings,
    last_input: Option<u64>,
    last_emitted: Option<u64>,
    /// Chunks emitted since the last keyframe; `None` before the first one.
    since_key: Option<u32>,
    force_next: bool,
    pending_bitrate: Option<u32>,
    rate: RateMeter,
    stats: Arc<EncoderStats>,
}

impl H264Encoder {
    pub fn new(settings: EncoderSettings, backend: Box<dyn CodecBackend>) -> Result<Self, EncoderError> {
        settings.check_resolution()?;
        if settings.bitrate_kbps == 0 || settings.keyframe_interval == 0 {
            return Err(EncoderError::Init(format!(
                "bitrate {} kbps / keyframe interval {} must be positive",
                settings.bitrate_kbps, settings.keyframe_interval
            )));
        }
        info!(
            backend = backend.name(),
            width = settings.width,
            height = settings.height,
            bitrate_kbps = settings.bitrate_kbps,
            keyframe_interval = settings.keyframe_interval,
            "Encoder ready"
        );
        Ok(Self {
            backend,
            rate: RateMeter::new(settings.fps, settings.bitrate_kbps),
            settings,
            last_input: None,
            last_emitted: None,
            since_key: None,
            force_next: false,
            pending_bitrate: None,
            stats: Arc::new(EncoderStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<EncoderStats> {
        Arc::clone(&self.stats)
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.settings.bitrate_kbps
    }

    /// Change the target bitrate at the start of the next GOP.
    pub fn request_bitrate(&mut self, kbps: u32) {
        if kbps == 0 || kbps == self.settings.bitrate_kbps {
            self.pending_bitrate = None;
            return;
        }
        debug!(kbps, "bitrate change queued for next keyframe");
        self.pending_bitrate = Some(kbps);
    }

    fn keyframe_due(&self) -> bool {
        match self.since_key {
            None => true,
            Some(n) => self.force_next || n + 1 >= self.settings.keyframe_interval,
        }
    }

    /// Encode one frame. Frames must arrive in increasing sequence order.
    ///
    /// A frame at or behind the last one seen is dropped; a gap is survivable
    /// but restarts the GOP with a keyframe.
    pub fn encode(&mut self, frame: AnnotatedFrame) -> Result<Vec<EncodedChunk>, EncoderError> {
        let sequence = frame.sequence;
        if let Some(last) = self.last_input {
            if sequence <= last {
                self.stats.stale.incr();
                warn!(sequence, last, "out-of-order frame dropped before encoding");
                return Ok(Vec::new());
            }
            if sequence != last + 1 {
                self.stats.discontinuities.incr();
                metrics::counter!("encoder_discontinuities_total").increment(1);
                debug!(sequence, missing = sequence - last - 1, "input gap, forcing keyframe");
                self.force_next = true;
            }
        }
        self.last_input = Some(sequence);
        self.stats.frames.incr();

        let keyframe = self.keyframe_due();
        if keyframe {
            self.apply_pending_bitrate()?;
        }

        let units = match self.backend.encode(&frame, keyframe) {
            Ok(units) => units,
            Err(e) => {
                self.stats.failures.incr();
                // The reference chain is suspect after a failed frame.
                self.force_next = true;
                return Err(e);
            }
        };
        if keyframe {
            self.force_next = false;
        }

        let chunks = self.accept(units);
        let bytes: usize = chunks.iter().map(|c| c.data.len()).sum();
        self.rate.record(bytes);
        Ok(chunks)
    }

    /// Drain whatever the backend still holds.
    pub fn flush(&mut self) -> Result<Vec<EncodedChunk>, EncoderError> {
        let units = self.backend.finish()?;
        Ok(self.accept(units))
    }

    fn apply_pending_bitrate(&mut self) -> Result<(), EncoderError> {
        let Some(kbps) = self.pending_bitrate.take() else {
            return Ok(());
        };
        self.backend.set_bitrate(kbps)?;
        info!(from = self.settings.bitrate_kbps, to = kbps, "bitrate changed at keyframe");
        self.settings.bitrate_kbps = kbps;
        self.rate.set_target(kbps);
        Ok(())
    }

    fn accept(&mut self, units: Vec<CodedUnit>) -> Vec<EncodedChunk> {
        let mut chunks = Vec::with_capacity(units.len());
        for unit in units {
            if self.last_emitted.is_some_and(|last| unit.sequence <= last) {
                warn!(sequence = unit.sequence, "backend emitted a unit out of order, discarding");
                continue;
            }
            self.last_emitted = Some(unit.sequence);

            if unit.is_keyframe {
                self.since_key = Some(0);
                self.stats.keyframes.incr();
                metrics::counter!("encoder_keyframes_total").increment(1);
            } else {
                self.since_key = self.since_key.map(|n| n + 1);
            }
            self.stats.chunks.incr();
            self.stats.bytes.add(unit.data.len() as u64);
            metrics::counter!("encoder_chunks_total").increment(1);

            chunks.push(EncodedChunk {
                data: unit.data,
                is_keyframe: unit.is_keyframe,
                sequence: unit.sequence,
            });
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    fn settings(keyframe_interval: u32) -> EncoderSettings {
        EncoderSettings {
            width: 32,
            height: 16,
            fps: 30,
            bitrate_kbps: 800,
            keyframe_interval,
        }
    }

    fn frame(sequence: u64) -> AnnotatedFrame {
        AnnotatedFrame {
            pixels: Bytes::from(vec![7u8; 32 * 16 * 3]),
            sequence,
            width: 32,
            height: 16,
            captured_at: Instant::now(),
            detections: None,
        }
    }

    /// Records the bitrate in effect for every encoded sequence.
    struct Recording {
        inner: SyntheticBackend,
        log: Arc<Mutex<Vec<(u64, bool, u32)>>>,
        bitrate: u32,
    }

    impl CodecBackend for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn encode(&mut self, frame: &AnnotatedFrame, force: bool) -> Result<Vec<CodedUnit>, EncoderError> {
            self.log.lock().unwrap().push((frame.sequence, force, self.bitrate));
            self.inner.encode(frame, force)
        }

        fn set_bitrate(&mut self, kbps: u32) -> Result<(), EncoderError> {
            self.bitrate = kbps;
            self.inner.set_bitrate(kbps)
        }
    }

    fn encoder(keyframe_interval: u32) -> H264Encoder {
        let s = settings(keyframe_interval);
        H264Encoder::new(s, Box::new(SyntheticBackend::open(s).unwrap())).unwrap()
    }

    #[test]
    fn keyframes_follow_interval() {
        let mut enc = encoder(5);
        let keys: Vec<u64> = (0..23)
            .flat_map(|seq| enc.encode(frame(seq)).unwrap())
            .filter(|c| c.is_keyframe)
            .map(|c| c.sequence)
            .collect();
        assert_eq!(keys, vec![0, 5, 10, 15, 20]);
        assert!(enc.encode(frame(23)).unwrap().iter().all(|c| nal::count_pictures(&c.data) == 1));
    }

    #[test]
    fn gap_restarts_gop() {
        let mut enc = encoder(30);
        for seq in 0..3 {
            enc.encode(frame(seq)).unwrap();
        }
        let after_gap = enc.encode(frame(7)).unwrap();
        assert_eq!(after_gap.len(), 1);
        assert!(after_gap[0].is_keyframe);
        assert_eq!(enc.stats().discontinuities.get(), 1);

        let next = enc.encode(frame(8)).unwrap();
        assert!(!next[0].is_keyframe);
    }

    #[test]
    fn stale_frames_are_dropped() {
        let mut enc = encoder(30);
        enc.encode(frame(4)).unwrap();
        assert!(enc.encode(frame(4)).unwrap().is_empty());
        assert!(enc.encode(frame(2)).unwrap().is_empty());
        assert_eq!(enc.stats().stale.get(), 2);
        assert_eq!(enc.encode(frame(5)).unwrap()[0].sequence, 5);
    }

    #[test]
    fn bitrate_change_waits_for_keyframe() {
        let s = settings(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        let backend = Recording {
            inner: SyntheticBackend::open(s).unwrap(),
            log: Arc::clone(&log),
            bitrate: s.bitrate_kbps,
        };
        let mut enc = H264Encoder::new(s, Box::new(backend)).unwrap();

        for seq in 0..2 {
            enc.encode(frame(seq)).unwrap();
        }
        enc.request_bitrate(400);
        for seq in 2..6 {
            enc.encode(frame(seq)).unwrap();
        }

        let log = log.lock().unwrap();
        assert_eq!(log[2], (2, false, 800));
        assert_eq!(log[3], (3, false, 800));
        assert_eq!(log[4], (4, true, 400));
        assert_eq!(log[5], (5, false, 400));
        assert_eq!(enc.bitrate_kbps(), 400);
    }

    #[test]
    fn unsupported_resolution_is_rejected() {
        let mut s = settings(30);
        s.height = 4097;
        let backend = Box::new(SyntheticBackend::open(settings(30)).unwrap());
        assert!(matches!(
            H264Encoder::new(s, backend),
            Err(EncoderError::UnsupportedResolution { .. })
        ));
    }
}
