//! Command-line flags. Every flag is optional and overrides the value from
//! the configuration file and environment.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{DetectorKind, EncoderKind, PipelineConfig, SourceKind};

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Camera to H.264 stream with periodic object detection overlay")]
pub struct Args {
    /// TOML configuration file.
    #[arg(long, env = "ARGUS_CONFIG")]
    pub config: Option<PathBuf>,

    /// ONNX detection model.
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Camera index (/dev/videoN).
    #[arg(long)]
    pub camera: Option<u32>,

    #[arg(long)]
    pub width: Option<u32>,

    #[arg(long)]
    pub height: Option<u32>,

    #[arg(long)]
    pub fps: Option<u32>,

    /// Confidence threshold, 0 to 1.
    #[arg(long)]
    pub conf: Option<f32>,

    /// Downstream ingest host.
    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Run detection on every Nth frame.
    #[arg(long, visible_alias = "yolo-interval")]
    pub detect_interval: Option<u32>,

    /// Target bitrate in kbps.
    #[arg(long)]
    pub bitrate: Option<u32>,

    /// Frames per GOP.
    #[arg(long)]
    pub keyframe_interval: Option<u32>,

    #[arg(long, value_enum)]
    pub source: Option<SourceKind>,

    #[arg(long, value_enum)]
    pub detector: Option<DetectorKind>,

    #[arg(long, value_enum)]
    pub encoder: Option<EncoderKind>,

    /// Print capture devices and exit.
    #[arg(long)]
    pub list_devices: bool,

    /// tracing filter directive, e.g. `argus=debug`.
    #[arg(long, env = "RUST_LOG")]
    pub log_filter: Option<String>,
}

impl Args {
    pub fn apply(&self, config: &mut PipelineConfig) {
        let capture = &mut config.capture;
        if let Some(index) = self.camera {
            capture.device_index = index;
        }
        if let Some(width) = self.width {
            capture.width = width;
        }
        if let Some(height) = self.height {
            capture.height = height;
        }
        if let Some(fps) = self.fps {
            capture.fps = fps;
        }
        if let Some(source) = self.source {
            capture.source = source;
        }

        let detection = &mut config.detection;
        if let Some(model) = &self.model {
            detection.model = Some(model.clone());
        }
        if let Some(conf) = self.conf {
            detection.confidence_threshold = conf;
        }
        if let Some(interval) = self.detect_interval {
            detection.interval = interval;
        }
        if let Some(detector) = self.detector {
            detection.backend = detector;
        }

        let encoder = &mut config.encoder;
        if let Some(bitrate) = self.bitrate {
            encoder.bitrate_kbps = bitrate;
        }
        if let Some(k) = self.keyframe_interval {
            encoder.keyframe_interval = k;
        }
        if let Some(kind) = self.encoder {
            encoder.backend = kind;
        }

        if let Some(host) = &self.host {
            config.sink.host = host.clone();
        }
        if let Some(port) = self.port {
            config.sink.port = port;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::try_parse_from([
            "argus",
            "--yolo-interval",
            "5",
            "--conf",
            "0.3",
            "--port",
            "6000",
            "--source",
            "test-pattern",
            "--encoder",
            "synthetic",
        ])
        .unwrap();

        let mut config = PipelineConfig::default();
        args.apply(&mut config);
        assert_eq!(config.detection.interval, 5);
        assert!((config.detection.confidence_threshold - 0.3).abs() < f32::EPSILON);
        assert_eq!(config.sink.port, 6000);
        assert_eq!(config.capture.source, SourceKind::TestPattern);
        assert_eq!(config.encoder.backend, EncoderKind::Synthetic);
        // Untouched values keep their defaults.
        assert_eq!(config.capture.width, 1280);
    }
}
