use image::DynamicImage;
use ndarray::Array2;
use shared::Detection;
use std::sync::Mutex;
use tch::{CModule, Device, IValue, Kind, Tensor};

use super::yolo::{self, DecodeParams};
use super::{ClassFilter, Detector, DetectorError, DetectorSettings};
use crate::config::DevicePreference;

/// COCO YOLO detector exported to TorchScript.
pub struct TorchDetector {
    model: Mutex<CModule>,
    device: Device,
    image_size: u32,
    iou_threshold: f32,
    max_detections: usize,
    num_classes: usize,
}

impl TorchDetector {
    pub fn load(settings: &DetectorSettings) -> Result<Self, DetectorError> {
        if !settings.model_path.is_file() {
            return Err(DetectorError::Load(format!(
                "model weights not found at {}",
                settings.model_path.display()
            )));
        }

        let device = match settings.device {
            DevicePreference::Auto => Device::cuda_if_available(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda(index) => Device::Cuda(index),
        };
        log::info!(
            "Loading TorchScript model {} on {:?}",
            settings.model_path.display(),
            device
        );

        let mut module = CModule::load_on_device(&settings.model_path, device)
            .map_err(|e| DetectorError::Load(e.to_string()))?;
        module.set_eval();

        Ok(Self {
            model: Mutex::new(module),
            device,
            image_size: settings.image_size,
            iou_threshold: settings.iou_threshold,
            max_detections: settings.max_detections,
            num_classes: settings.num_classes,
        })
    }

    fn forward(&self, input: Tensor) -> Result<Tensor, DetectorError> {
        let model = self
            .model
            .lock()
            .map_err(|_| DetectorError::Inference("model mutex poisoned".into()))?;

        // Some exports return a tuple (predictions, protos); take the first tensor.
        let output = tch::no_grad(|| match model.forward_ts(&[input.shallow_clone()]) {
            Ok(tensor) => Ok(tensor),
            Err(ts_err) => match model.forward_is(&[IValue::Tensor(input)]) {
                Ok(IValue::Tensor(tensor)) => Ok(tensor),
                Ok(IValue::Tuple(items)) | Ok(IValue::GenericList(items)) => items
                    .into_iter()
                    .find_map(|item| match item {
                        IValue::Tensor(tensor) => Some(tensor),
                        _ => None,
                    })
                    .ok_or_else(|| "model returned no tensor".to_string()),
                Ok(other) => Err(format!("unexpected model output: {:?}", other)),
                Err(e) => Err(format!("{}; original: {}", e, ts_err)),
            },
        });
        output.map_err(DetectorError::Inference)
    }
}

impl Detector for TorchDetector {
    fn name(&self) -> &'static str {
        "torch"
    }

    fn detect(
        &self,
        image: &DynamicImage,
        confidence: f32,
        classes: &ClassFilter,
    ) -> Result<Vec<Detection>, DetectorError> {
        let (canvas, letterbox) = yolo::letterbox(image, self.image_size);
        let side = i64::from(self.image_size);
        let input = Tensor::from_slice(&yolo::to_chw(&canvas))
            .view([1, 3, side, side])
            .to_device(self.device);

        let output = self.forward(input)?;
        let output = output.to_device(Device::Cpu).to_kind(Kind::Float);
        let shape = output.size();
        let (rows, cols) = match shape.as_slice() {
            [1, rows, cols] | [rows, cols] => (*rows as usize, *cols as usize),
            other => {
                return Err(DetectorError::Inference(format!(
                    "unexpected output shape {:?}",
                    other
                )));
            }
        };

        let flat = Vec::<f32>::try_from(output.flatten(0, -1))
            .map_err(|e| DetectorError::Inference(e.to_string()))?;
        let predictions = Array2::from_shape_vec((rows, cols), flat)
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let params = DecodeParams {
            confidence,
            iou_threshold: self.iou_threshold,
            max_detections: self.max_detections,
            num_classes: self.num_classes,
            classes,
        };
        yolo::decode(predictions.view(), &letterbox, &params)
    }
}
