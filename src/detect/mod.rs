pub mod cache;
pub mod detector;
pub mod scheduler;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use cache::DetectionCache;
pub use detector::{BoundingBox, DetectionResult, Detector};
pub use scheduler::{DetectionScheduler, Dispatch, SchedulerStats};
pub use stub::StubDetector;

use std::sync::Arc;

use tracing::info;

use crate::config::{DetectionConfig, DetectorKind};
use crate::error::DetectError;

/// Build the detector selected in the configuration.
///
/// `Disabled` yields a detector that never finds anything, so the pipeline
/// shape stays the same.
pub fn from_config(config: &DetectionConfig, width: u32, height: u32) -> Result<Arc<dyn Detector>, DetectError> {
    let detector: Arc<dyn Detector> = match config.backend {
        DetectorKind::Stub => Arc::new(StubDetector::centred(width, height)),
        DetectorKind::Disabled => Arc::new(StubDetector::new(Vec::new())),
        #[cfg(feature = "backend-tract")]
        DetectorKind::Tract => {
            let model = config
                .model
                .as_ref()
                .ok_or_else(|| DetectError::Backend("no model path configured".into()))?;
            Arc::new(tract::TractDetector::load(model, config)?)
        }
        #[cfg(not(feature = "backend-tract"))]
        DetectorKind::Tract => {
            return Err(DetectError::Backend(
                "tract detector requested but the backend-tract feature is disabled".into(),
            ))
        }
    };
    detector.warm_up()?;
    info!("Detector ready: {}", detector.name());
    Ok(detector)
}
