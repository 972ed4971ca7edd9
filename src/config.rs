//! Pipeline configuration.
//!
//! Layered as built-in defaults, an optional TOML file, `ARGUS__SECTION__KEY`
//! environment variables and finally command-line overrides. The validated
//! result is shared as `Arc<PipelineConfig>` and never mutated.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::capture::PixelFormat;
use crate::error::ConfigError;

/// Largest frame edge accepted by the encoder stage.
pub const MAX_DIMENSION: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub capture: CaptureConfig,
    pub detection: DetectionConfig,
    pub overlay: OverlayConfig,
    pub encoder: EncoderConfig,
    pub sink: SinkConfig,
    pub queues: QueueConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Device,
    TestPattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: SourceKind,
    pub device_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Pin the capture thread to this CPU core.
    pub pin_core: Option<usize>,
    /// Stop after this many frames (test pattern only).
    pub frame_limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DetectorKind {
    Tract,
    Stub,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub backend: DetectorKind,
    pub model: Option<PathBuf>,
    pub confidence_threshold: f32,
    /// Run inference on every Nth frame.
    pub interval: u32,
    pub max_in_flight: usize,
    pub inference_timeout_ms: u64,
    /// Square model input edge in pixels.
    pub input_size: u32,
    pub iou_threshold: f32,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub show_status: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EncoderKind {
    X264,
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub backend: EncoderKind,
    pub bitrate_kbps: u32,
    /// Frames per GOP.
    pub keyframe_interval: u32,
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub host: String,
    pub port: u16,
    /// Encoded chunks held while the connection is slow or down.
    pub buffer_capacity: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    /// A single chunk write taking longer than this drops the connection.
    pub write_timeout_ms: u64,
    pub flush_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capture_capacity: usize,
    pub encode_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: if cfg!(feature = "v4l2") {
                SourceKind::Device
            } else {
                SourceKind::TestPattern
            },
            device_index: 0,
            width: 1280,
            height: 720,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            pin_core: None,
            frame_limit: None,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            backend: if cfg!(feature = "backend-tract") {
                DetectorKind::Tract
            } else {
                DetectorKind::Stub
            },
            model: None,
            confidence_threshold: 0.5,
            interval: 3,
            max_in_flight: 1,
            inference_timeout_ms: 2_000,
            input_size: 640,
            iou_threshold: 0.45,
            labels: Vec::new(),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self { show_status: true }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            backend: if cfg!(feature = "gstreamer-pipeline") {
                EncoderKind::X264
            } else {
                EncoderKind::Synthetic
            },
            bitrate_kbps: 1500,
            // 3 seconds at 30 fps
            keyframe_interval: 90,
            max_consecutive_failures: 10,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5000,
            buffer_capacity: 64,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            connect_timeout_ms: 2_000,
            write_timeout_ms: 2_000,
            flush_timeout_ms: 2_000,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capture_capacity: 4,
            encode_capacity: 4,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            detection: DetectionConfig::default(),
            overlay: OverlayConfig::default(),
            encoder: EncoderConfig::default(),
            sink: SinkConfig::default(),
            queues: QueueConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Merge defaults, an optional TOML file and `ARGUS__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("ARGUS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("detection.labels"),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return Err(ConfigError::invalid("capture.width/height", "must be positive"));
        }
        if capture.width % 2 != 0 || capture.height % 2 != 0 {
            return Err(ConfigError::invalid(
                "capture.width/height",
                format!("{}x{} must be even for 4:2:0 encoding", capture.width, capture.height),
            ));
        }
        if capture.width > MAX_DIMENSION || capture.height > MAX_DIMENSION {
            return Err(ConfigError::invalid(
                "capture.width/height",
                format!("must not exceed {MAX_DIMENSION}"),
            ));
        }
        if capture.fps == 0 {
            return Err(ConfigError::invalid("capture.fps", "must be positive"));
        }
        if capture.buffer_count == 0 {
            return Err(ConfigError::invalid("capture.buffer_count", "must be positive"));
        }

        let detection = &self.detection;
        if !(0.0..=1.0).contains(&detection.confidence_threshold) {
            return Err(ConfigError::invalid(
                "detection.confidence_threshold",
                format!("{} is outside 0..=1", detection.confidence_threshold),
            ));
        }
        if detection.interval == 0 {
            return Err(ConfigError::invalid("detection.interval", "must be at least 1"));
        }
        if detection.max_in_flight == 0 {
            return Err(ConfigError::invalid("detection.max_in_flight", "must be at least 1"));
        }
        if detection.backend == DetectorKind::Tract && detection.model.is_none() {
            return Err(ConfigError::invalid(
                "detection.model",
                "is required by the tract detector",
            ));
        }
        if !(0.0..=1.0).contains(&detection.iou_threshold) {
            return Err(ConfigError::invalid("detection.iou_threshold", "is outside 0..=1"));
        }

        let encoder = &self.encoder;
        if encoder.bitrate_kbps == 0 {
            return Err(ConfigError::invalid("encoder.bitrate_kbps", "must be positive"));
        }
        if encoder.keyframe_interval == 0 {
            return Err(ConfigError::invalid("encoder.keyframe_interval", "must be at least 1"));
        }

        let sink = &self.sink;
        if sink.host.trim().is_empty() {
            return Err(ConfigError::invalid("sink.host", "must not be empty"));
        }
        if sink.port == 0 {
            return Err(ConfigError::invalid("sink.port", "must not be 0"));
        }
        if sink.buffer_capacity == 0 {
            return Err(ConfigError::invalid("sink.buffer_capacity", "must be positive"));
        }
        if sink.write_timeout_ms == 0 {
            return Err(ConfigError::invalid("sink.write_timeout_ms", "must be positive"));
        }
        if sink.initial_backoff_ms == 0 || sink.max_backoff_ms < sink.initial_backoff_ms {
            return Err(ConfigError::invalid(
                "sink.max_backoff_ms",
                "must be at least the positive initial backoff",
            ));
        }

        if self.queues.capture_capacity == 0 || self.queues.encode_capacity == 0 {
            return Err(ConfigError::invalid("queues", "capacities must be positive"));
        }
        Ok(())
    }

    pub fn sink_address(&self) -> String {
        format!("{}:{}", self.sink.host, self.sink.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_720p30_interval3_1500kbps() {
        let config = PipelineConfig::default();
        assert_eq!((config.capture.width, config.capture.height), (1280, 720));
        assert_eq!(config.detection.interval, 3);
        assert_eq!(config.encoder.bitrate_kbps, 1500);
        assert_eq!(config.encoder.keyframe_interval, 90);
        assert_eq!(config.sink.port, 5000);
        assert!((config.detection.confidence_threshold - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[capture]
source = "test-pattern"
width = 640
height = 360

[detection]
backend = "stub"
interval = 5
labels = ["person", "car"]

[sink]
host = "ingest.local"
port = 6000
"#
        )
        .unwrap();

        let config = PipelineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.capture.source, SourceKind::TestPattern);
        assert_eq!((config.capture.width, config.capture.height), (640, 360));
        assert_eq!(config.capture.fps, 30);
        assert_eq!(config.detection.interval, 5);
        assert_eq!(config.detection.labels, vec!["person", "car"]);
        assert_eq!(config.sink_address(), "ingest.local:6000");
        assert_eq!(config.encoder.keyframe_interval, 90);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = PipelineConfig::load(Some(Path::new("/nonexistent/argus.toml")));
        assert!(matches!(err, Err(ConfigError::Load(_))));
    }

    fn valid() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.detection.backend = DetectorKind::Stub;
        config
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        assert!(valid().validate().is_ok());

        let mut c = valid();
        c.detection.confidence_threshold = 1.5;
        assert!(c.validate().is_err());

        let mut c = valid();
        c.detection.interval = 0;
        assert!(c.validate().is_err());

        let mut c = valid();
        c.encoder.keyframe_interval = 0;
        assert!(c.validate().is_err());

        let mut c = valid();
        c.encoder.bitrate_kbps = 0;
        assert!(c.validate().is_err());

        let mut c = valid();
        c.capture.width = 641;
        assert!(c.validate().is_err());

        let mut c = valid();
        c.sink.port = 0;
        assert!(c.validate().is_err());

        let mut c = valid();
        c.sink.write_timeout_ms = 0;
        assert!(c.validate().is_err());

        let mut c = valid();
        c.sink.max_backoff_ms = 10;
        assert!(c.validate().is_err());

        let mut c = valid();
        c.detection.backend = DetectorKind::Tract;
        c.detection.model = None;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Invalid { field: "detection.model", .. })
        ));
    }
}
