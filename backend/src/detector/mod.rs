pub mod contour;
pub mod service;
#[cfg(feature = "torch")]
pub mod torch;
pub mod yolo;

use image::DynamicImage;
use shared::{Detection, SupportedClass};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{DetectorConfig, DevicePreference};
use crate::storage::StorageError;

pub use contour::ContourDetector;
pub use service::{DetectionResult, DetectionService, DetectorKind, PrimaryLoader};

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Model load error: {0}")]
    Load(String),
    #[error("Detector unavailable: {0}")]
    Unavailable(String),
    #[error("Inference error: {0}")]
    Inference(String),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// A detection backend. Implementations must be usable from several worker
/// threads at once.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs detection on `image`. Implementations may return classes outside
    /// `classes`; callers post-filter.
    fn detect(
        &self,
        image: &DynamicImage,
        confidence: f32,
        classes: &ClassFilter,
    ) -> Result<Vec<Detection>, DetectorError>;
}

/// The set of supported classes a request is restricted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassFilter {
    classes: Vec<SupportedClass>,
}

impl Default for ClassFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl ClassFilter {
    pub fn all() -> Self {
        Self {
            classes: SupportedClass::ALL.to_vec(),
        }
    }

    /// Unsupported ids are discarded; if nothing supported remains (or no
    /// filter was given) the full supported set is used.
    pub fn resolve(requested: Option<&[i64]>) -> Self {
        let Some(requested) = requested else {
            return Self::all();
        };

        let mut classes: Vec<SupportedClass> = requested
            .iter()
            .filter_map(|&id| SupportedClass::from_id(id))
            .collect();
        classes.sort();
        classes.dedup();

        if classes.is_empty() {
            log::warn!(
                "No valid classes in {:?}, using all supported classes",
                requested
            );
            return Self::all();
        }
        Self { classes }
    }

    pub fn classes(&self) -> &[SupportedClass] {
        &self.classes
    }

    pub fn ids(&self) -> Vec<u32> {
        self.classes.iter().map(|class| class.id()).collect()
    }

    pub fn allows_id(&self, id: i64) -> bool {
        SupportedClass::from_id(id).is_some_and(|class| self.classes.contains(&class))
    }
}

/// Explicit load parameters for the primary model.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub model_path: PathBuf,
    pub device: DevicePreference,
    pub image_size: u32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub num_classes: usize,
}

impl DetectorSettings {
    pub fn from_config(config: &DetectorConfig) -> Result<Self, DetectorError> {
        let device = DevicePreference::parse(&config.device).map_err(DetectorError::Load)?;
        Ok(Self {
            model_path: config.model_path.clone(),
            device,
            image_size: config.image_size,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
            num_classes: config.num_classes,
        })
    }
}

/// Loads the primary (model-based) detector.
pub fn load_primary(settings: &DetectorSettings) -> Result<Arc<dyn Detector>, DetectorError> {
    #[cfg(feature = "torch")]
    {
        let detector = torch::TorchDetector::load(settings)?;
        Ok(Arc::new(detector))
    }

    #[cfg(not(feature = "torch"))]
    {
        Err(DetectorError::Unavailable(format!(
            "built without the `torch` feature, cannot load {}",
            settings.model_path.display()
        )))
    }
}
