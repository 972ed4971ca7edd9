//! x264 through a GStreamer appsrc ! x264enc ! appsink pipeline.

use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use super::backend::{CodecBackend, CodedUnit, EncoderSettings};
use crate::error::EncoderError;
use crate::overlay::AnnotatedFrame;

/// First pull after a push waits this long for the encoder.
const PULL_TIMEOUT: Duration = Duration::from_millis(500);

pub struct X264Backend {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    encoder: gst::Element,
    settings: EncoderSettings,
    frame_ns: u64,
}

impl X264Backend {
    pub fn open(settings: EncoderSettings) -> Result<Self, EncoderError> {
        settings.check_resolution()?;
        gst::init().map_err(|e| EncoderError::Init(format!("GStreamer init: {e}")))?;

        let launch = Self::build_pipeline_string(&settings);
        info!("Encoder pipeline: {}", launch);

        let pipeline = gst::parse::launch(&launch)
            .map_err(|e| EncoderError::Init(format!("failed to parse pipeline: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| EncoderError::Init("launch string is not a pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .and_then(|e| e.downcast::<gst_app::AppSrc>().ok())
            .ok_or_else(|| EncoderError::Init("appsrc element missing".into()))?;
        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<gst_app::AppSink>().ok())
            .ok_or_else(|| EncoderError::Init("appsink element missing".into()))?;
        let encoder = pipeline
            .by_name("enc")
            .ok_or_else(|| EncoderError::Init("x264enc element missing".into()))?;

        appsrc.set_format(gst::Format::Time);
        appsrc.set_is_live(true);
        appsink.set_property("sync", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncoderError::Init(format!("failed to start pipeline: {e}")))?;

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            encoder,
            frame_ns: settings.frame_duration_ns(),
            settings,
        })
    }

    fn build_pipeline_string(s: &EncoderSettings) -> String {
        format!(
            "appsrc name=src is-live=true format=time \
             caps=video/x-raw,format=RGB,width={w},height={h},framerate={fps}/1 ! \
             videoconvert ! video/x-raw,format=I420 ! \
             x264enc name=enc tune=zerolatency speed-preset=ultrafast key-int-max={k} \
             bitrate={b} bframes=0 byte-stream=true ! \
             h264parse config-interval=-1 ! \
             video/x-h264,stream-format=byte-stream,alignment=au ! \
             appsink name=sink sync=false",
            w = s.width,
            h = s.height,
            fps = s.fps,
            k = s.keyframe_interval,
            b = s.bitrate_kbps,
        )
    }

    fn check_bus(&self) -> Result<(), EncoderError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Warning]) {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    return Err(EncoderError::Encode {
                        sequence: 0,
                        reason: format!("{} ({:?})", err.error(), err.debug()),
                    });
                }
                gst::MessageView::Warning(w) => warn!("Encoder pipeline warning: {}", w.error()),
                _ => {}
            }
        }
        Ok(())
    }

    fn pull(&self, timeout: Duration) -> Option<CodedUnit> {
        let sample = self
            .appsink
            .try_pull_sample(gst::ClockTime::from_nseconds(timeout.as_nanos() as u64))?;
        let buffer = sample.buffer()?;
        let map = buffer.map_readable().ok()?;
        let pts = buffer.pts().map(|t| t.nseconds()).unwrap_or(0);
        Some(CodedUnit {
            data: bytes::Bytes::copy_from_slice(map.as_slice()),
            is_keyframe: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
            sequence: (pts + self.frame_ns / 2) / self.frame_ns,
        })
    }

    fn drain(&self, first_wait: Duration) -> Vec<CodedUnit> {
        let mut units = Vec::new();
        let mut wait = first_wait;
        while let Some(unit) = self.pull(wait) {
            units.push(unit);
            wait = Duration::ZERO;
        }
        units
    }
}

impl CodecBackend for X264Backend {
    fn name(&self) -> &'static str {
        "x264"
    }

    fn encode(&mut self, frame: &AnnotatedFrame, force_keyframe: bool) -> Result<Vec<CodedUnit>, EncoderError> {
        if frame.width != self.settings.width || frame.height != self.settings.height {
            return Err(EncoderError::Encode {
                sequence: frame.sequence,
                reason: format!("frame is {}x{}", frame.width, frame.height),
            });
        }

        if force_keyframe {
            let event = gst_video::UpstreamForceKeyUnitEvent::builder()
                .all_headers(true)
                .build();
            if !self.encoder.send_event(event) {
                debug!(sequence = frame.sequence, "force-key-unit event not handled");
            }
        }

        let mut buffer = gst::Buffer::from_slice(frame.pixels.clone());
        if let Some(buf) = buffer.get_mut() {
            let pts = gst::ClockTime::from_nseconds(frame.sequence * self.frame_ns);
            buf.set_pts(pts);
            buf.set_duration(gst::ClockTime::from_nseconds(self.frame_ns));
        }
        self.appsrc.push_buffer(buffer).map_err(|e| EncoderError::Encode {
            sequence: frame.sequence,
            reason: format!("appsrc rejected buffer: {e:?}"),
        })?;

        self.check_bus()?;
        Ok(self.drain(PULL_TIMEOUT))
    }

    fn set_bitrate(&mut self, kbps: u32) -> Result<(), EncoderError> {
        self.encoder.set_property("bitrate", kbps);
        self.settings.bitrate_kbps = kbps;
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<CodedUnit>, EncoderError> {
        self.appsrc
            .end_of_stream()
            .map_err(|e| EncoderError::Encode {
                sequence: 0,
                reason: format!("end of stream rejected: {e:?}"),
            })?;
        Ok(self.drain(PULL_TIMEOUT))
    }
}

impl Drop for X264Backend {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
