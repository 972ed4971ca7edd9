//! Deterministic stand-in codec.
//!
//! Emits well-formed Annex-B access units (SPS + PPS + IDR for keyframes, a
//! non-IDR slice otherwise) whose sizes follow a closed-loop rate controller,
//! so cadence and bitrate behaviour can be exercised without GStreamer.

use bytes::{BufMut, Bytes, BytesMut};

use super::backend::{CodecBackend, CodedUnit, EncoderSettings};
use super::nal::START_CODE;
use crate::error::EncoderError;
use crate::overlay::AnnotatedFrame;

const KEYFRAME_WEIGHT: i64 = 4;
const MIN_PAYLOAD: i64 = 16;
const SPS: [u8; 8] = [0x67, 0x42, 0xc0, 0x1f, 0xda, 0x01, 0x40, 0x16];
const PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];

pub struct SyntheticBackend {
    settings: EncoderSettings,
    bitrate_kbps: u32,
    /// Target bytes minus produced bytes so far.
    balance: i64,
    frames: u64,
}

impl SyntheticBackend {
    pub fn open(settings: EncoderSettings) -> Result<Self, EncoderError> {
        settings.check_resolution()?;
        Ok(Self {
            settings,
            bitrate_kbps: settings.bitrate_kbps,
            balance: 0,
            frames: 0,
        })
    }

    fn frame_budget(&self) -> i64 {
        (self.bitrate_kbps as i64 * 1000 / 8) / self.settings.fps.max(1) as i64
    }

    fn access_unit(&self, frame: &AnnotatedFrame, keyframe: bool, payload: usize) -> Bytes {
        let seed = frame
            .pixels
            .iter()
            .step_by(997)
            .fold(frame.sequence as usize, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as usize));

        let mut out = BytesMut::with_capacity(payload + 32);
        if keyframe {
            out.put_slice(&START_CODE);
            out.put_slice(&SPS);
            out.put_slice(&START_CODE);
            out.put_slice(&PPS);
        }
        out.put_slice(&START_CODE);
        out.put_u8(if keyframe { 0x65 } else { 0x41 });
        // Filler never contains zero bytes, so no start code can be emulated.
        for i in 0..payload {
            out.put_u8((seed.wrapping_add(i * 31) % 255 + 1) as u8);
        }
        out.freeze()
    }
}

impl CodecBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn encode(&mut self, frame: &AnnotatedFrame, force_keyframe: bool) -> Result<Vec<CodedUnit>, EncoderError> {
        if frame.width != self.settings.width || frame.height != self.settings.height {
            return Err(EncoderError::Encode {
                sequence: frame.sequence,
                reason: format!(
                    "frame is {}x{}, encoder opened for {}x{}",
                    frame.width, frame.height, self.settings.width, self.settings.height
                ),
            });
        }

        let keyframe = force_keyframe || self.frames == 0;
        let budget = self.frame_budget();
        let nominal = if keyframe { budget * KEYFRAME_WEIGHT } else { budget };
        let size = (nominal + self.balance / 8).clamp(MIN_PAYLOAD, (nominal * 2).max(MIN_PAYLOAD));

        let data = self.access_unit(frame, keyframe, size as usize);
        self.balance += budget - data.len() as i64;
        self.frames += 1;

        Ok(vec![CodedUnit {
            data,
            is_keyframe: keyframe,
            sequence: frame.sequence,
        }])
    }

    fn set_bitrate(&mut self, kbps: u32) -> Result<(), EncoderError> {
        self.bitrate_kbps = kbps;
        self.balance = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::nal;
    use std::time::Instant;

    pub(crate) fn frame(sequence: u64, width: u32, height: u32) -> AnnotatedFrame {
        AnnotatedFrame {
            pixels: Bytes::from(vec![(sequence % 251) as u8; (width * height * 3) as usize]),
            sequence,
            width,
            height,
            captured_at: Instant::now(),
            detections: None,
        }
    }

    fn settings(bitrate_kbps: u32) -> EncoderSettings {
        EncoderSettings {
            width: 64,
            height: 48,
            fps: 30,
            bitrate_kbps,
            keyframe_interval: 30,
        }
    }

    #[test]
    fn units_are_valid_annex_b() {
        let mut codec = SyntheticBackend::open(settings(500)).unwrap();
        let key = codec.encode(&frame(0, 64, 48), false).unwrap().remove(0);
        let delta = codec.encode(&frame(1, 64, 48), false).unwrap().remove(0);

        assert!(key.is_keyframe && nal::contains_keyframe(&key.data));
        let kinds: Vec<u8> = nal::nal_units(&key.data).map(|n| n.kind).collect();
        assert_eq!(kinds, vec![nal::NAL_SPS, nal::NAL_PPS, nal::NAL_IDR]);

        assert!(!delta.is_keyframe && !nal::contains_keyframe(&delta.data));
        assert_eq!(nal::count_pictures(&delta.data), 1);
    }

    #[test]
    fn long_run_bitrate_tracks_target() {
        let mut codec = SyntheticBackend::open(settings(1000)).unwrap();
        let total: usize = (0..300u64)
            .map(|seq| {
                codec
                    .encode(&frame(seq, 64, 48), seq % 30 == 0)
                    .unwrap()
                    .iter()
                    .map(|u| u.data.len())
                    .sum::<usize>()
            })
            .sum();
        // 10 seconds at 1000 kbps.
        let target = 1_000_000 / 8 * 10;
        let error = (total as f64 - target as f64).abs() / target as f64;
        assert!(error < 0.05, "produced {total} bytes for a {target} byte target");
    }

    #[test]
    fn odd_resolution_fails_to_open() {
        let mut s = settings(500);
        s.width = 63;
        assert!(matches!(
            SyntheticBackend::open(s),
            Err(EncoderError::UnsupportedResolution { .. })
        ));
    }
}
