use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, IntoEnumIterator};

/// The subset of COCO categories the service reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, AsRefStr, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum SupportedClass {
    Person,
    Car,
    Bus,
    Truck,
}

impl SupportedClass {
    pub const ALL: [SupportedClass; 4] = [
        SupportedClass::Person,
        SupportedClass::Car,
        SupportedClass::Bus,
        SupportedClass::Truck,
    ];

    /// COCO class index.
    pub fn id(self) -> u32 {
        match self {
            SupportedClass::Person => 0,
            SupportedClass::Car => 2,
            SupportedClass::Bus => 5,
            SupportedClass::Truck => 7,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        SupportedClass::iter().find(|class| i64::from(class.id()) == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Builds a box from two corners, normalising their order so that
    /// `x2 >= x1` and `y2 >= y1` always hold.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        let (x1, x2) = if x1 <= x2 { (x1, x2) } else { (x2, x1) };
        let (y1, y2) = if y1 <= y2 { (y1, y2) } else { (y2, y1) };
        Self {
            x1,
            y1,
            x2,
            y2,
            width: x2 - x1,
            height: y2 - y1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class: SupportedClass, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id: class.id(),
            class_name: class.as_ref().to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DetectResponse {
    pub message: String,
    pub objects_detected: Vec<Detection>,
    pub inference_time: String,
    pub result_image_url: String,
    pub original_image_url: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClassInfo {
    pub id: u32,
    pub name: String,
}

impl From<SupportedClass> for ClassInfo {
    fn from(class: SupportedClass) -> Self {
        Self {
            id: class.id(),
            name: class.as_ref().to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ApiInfo {
    pub message: String,
    pub version: String,
    pub endpoints: std::collections::BTreeMap<String, String>,
    pub supported_classes: Vec<ClassInfo>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TestImageResponse {
    pub message: String,
    pub image_url: String,
    pub width: u32,
    pub height: u32,
    pub num_shapes: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ModelStatus {
    pub model_initialized: bool,
    pub model_loaded: bool,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub load_error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TestDetectResponse {
    pub status: String,
    pub message: String,
    pub inference_time: String,
    pub detections_count: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result_image_url: Option<String>,
}
