use actix_files::{Files, NamedFile};
use actix_multipart::{Field, Multipart};
use actix_web::{HttpResponse, web};
use futures::TryStreamExt;
use image::DynamicImage;
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use shared::{
    ApiInfo, ClassInfo, DetectResponse, SupportedClass, TestDetectResponse, TestImageResponse,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::config::StorageConfig;
use crate::detector::{DetectionResult, DetectionService};
use crate::error::ApiError;
use crate::storage::{FileStore, Pool};
use crate::synthetic::{self, MAX_DIMENSION, MAX_SHAPES};

const DEFAULT_CONFIDENCE: f32 = 0.25;
const MAX_FIELD_BYTES: usize = 1024;

/// Per-app settings the handlers need besides the detection service.
#[derive(Debug, Clone)]
pub struct RouteSettings {
    pub static_dir: PathBuf,
    pub max_upload_bytes: usize,
}

/// Mounts the API and the static pools. The caller provides
/// `web::Data<DetectionService>`.
pub fn configure_routes(
    cfg: &mut web::ServiceConfig,
    storage: &StorageConfig,
    max_upload_bytes: usize,
) {
    cfg.app_data(web::Data::new(RouteSettings {
        static_dir: storage.static_dir.clone(),
        max_upload_bytes,
    }))
    .service(web::resource("/").route(web::get().to(index)))
    .service(web::resource("/api").route(web::get().to(api_info)))
    .service(web::resource("/detect").route(web::post().to(detect_objects)))
    .service(web::resource("/result/{filename}").route(web::get().to(get_result_image)))
    .service(
        web::resource("/generate-test-image")
            .route(web::get().to(create_test_image))
            .route(web::post().to(create_test_image)),
    )
    .service(web::resource("/test").route(web::get().to(test_api)))
    .service(web::resource("/test-model").route(web::get().to(test_model)))
    .service(web::resource("/test-detect").route(web::get().to(test_detect)))
    .service(Files::new(Pool::Uploads.url_prefix(), &storage.uploads_dir))
    .service(Files::new(Pool::Results.url_prefix(), &storage.results_dir))
    .service(Files::new(Pool::TestImages.url_prefix(), &storage.test_images_dir))
    .service(Files::new("/static", &storage.static_dir));
}

async fn index(settings: web::Data<RouteSettings>) -> Result<NamedFile, ApiError> {
    let path = settings.static_dir.join("index.html");
    NamedFile::open_async(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("Landing page unavailable: {}", e)))
}

async fn api_info() -> HttpResponse {
    let endpoints: BTreeMap<String, String> = [
        ("detect", "/detect"),
        ("result", "/result/{filename}"),
        ("generate_test_image", "/generate-test-image"),
        ("test", "/test"),
        ("test_model", "/test-model"),
        ("test_detect", "/test-detect"),
    ]
    .into_iter()
    .map(|(name, path)| (name.to_string(), path.to_string()))
    .collect();

    HttpResponse::Ok().json(ApiInfo {
        message: "Welcome to the Object Detection API".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        endpoints,
        supported_classes: SupportedClass::ALL.iter().copied().map(ClassInfo::from).collect(),
    })
}

struct UploadedFile {
    data: Vec<u8>,
    filename: Option<String>,
    content_type: String,
}

#[derive(Default)]
struct DetectForm {
    file: Option<UploadedFile>,
    conf: Option<String>,
    classes: Vec<String>,
}

impl DetectForm {
    async fn read(mut payload: Multipart, max_upload_bytes: usize) -> Result<Self, ApiError> {
        let mut form = DetectForm::default();

        while let Some(mut field) = payload
            .try_next()
            .await
            .map_err(|e| ApiError::Payload(e.to_string()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    let content_type = field
                        .content_type()
                        .map(|mime| mime.essence_str().to_string())
                        .unwrap_or_default();
                    if !content_type.starts_with("image/") {
                        return Err(ApiError::NotAnImage);
                    }
                    let filename = field
                        .content_disposition()
                        .and_then(|cd| cd.get_filename())
                        .map(str::to_string);
                    let data = read_field(&mut field, max_upload_bytes)
                        .await?
                        .ok_or(ApiError::PayloadTooLarge {
                            limit: max_upload_bytes,
                        })?;
                    form.file = Some(UploadedFile {
                        data,
                        filename,
                        content_type,
                    });
                }
                "conf" | "classes" => {
                    let data = read_field(&mut field, MAX_FIELD_BYTES)
                        .await?
                        .ok_or_else(|| ApiError::InvalidParameter {
                            name: if name == "conf" { "conf" } else { "classes" },
                            reason: "value too long".to_string(),
                        })?;
                    let value = String::from_utf8_lossy(&data).trim().to_string();
                    if name == "conf" {
                        form.conf = Some(value);
                    } else {
                        form.classes.push(value);
                    }
                }
                other => {
                    warn!("Ignoring unexpected form field '{}'", other);
                    while field
                        .try_next()
                        .await
                        .map_err(|e| ApiError::Payload(e.to_string()))?
                        .is_some()
                    {}
                }
            }
        }

        Ok(form)
    }

    fn confidence(&self) -> Result<f32, ApiError> {
        let Some(raw) = self.conf.as_deref().filter(|raw| !raw.is_empty()) else {
            return Ok(DEFAULT_CONFIDENCE);
        };
        match raw.parse::<f32>() {
            Ok(conf) if (0.0..=1.0).contains(&conf) => Ok(conf),
            _ => Err(ApiError::InvalidParameter {
                name: "conf",
                reason: format!("'{}' is not a number between 0 and 1", raw),
            }),
        }
    }

    /// `None` when no `classes` field was sent; values that are not integers
    /// are dropped.
    fn classes(&self) -> Option<Vec<i64>> {
        if self.classes.is_empty() {
            return None;
        }
        let parsed = self
            .classes
            .iter()
            .filter_map(|raw| match raw.parse::<i64>() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!("Ignoring non-integer class id '{}'", raw);
                    None
                }
            })
            .collect();
        Some(parsed)
    }
}

/// Reads a whole field. `Ok(None)` if it exceeds `limit` bytes.
async fn read_field(field: &mut Field, limit: usize) -> Result<Option<Vec<u8>>, ApiError> {
    let mut data = Vec::new();
    while let Some(chunk) = field
        .try_next()
        .await
        .map_err(|e| ApiError::Payload(e.to_string()))?
    {
        if data.len() + chunk.len() > limit {
            return Ok(None);
        }
        data.extend_from_slice(&chunk);
    }
    Ok(Some(data))
}

async fn detect_objects(
    service: web::Data<DetectionService>,
    settings: web::Data<RouteSettings>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let form = DetectForm::read(payload, settings.max_upload_bytes).await?;
    let confidence = form.confidence()?;
    let classes = form.classes();
    let upload = form.file.ok_or(ApiError::MissingFile)?;

    let UploadedFile {
        data,
        filename,
        content_type,
    } = upload;
    let data = Arc::new(data);

    let bytes = Arc::clone(&data);
    let image = web::block(move || image::load_from_memory(&bytes))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::InvalidImage(e.to_string()))?;

    let store = service.store().clone();
    let stored = web::block(move || store.save_upload(&data, filename.as_deref(), &content_type))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    info!("Saved upload as {}", stored.filename);

    let start = Instant::now();
    let result = service.detect(Arc::new(image), confidence, classes).await;
    let elapsed = start.elapsed();

    let result_name = result.image_filename().ok_or(ApiError::DetectionFailed)?;
    info!(
        "Detection finished in {:.4}s via {} detector, {} objects",
        elapsed.as_secs_f64(),
        result.kind,
        result.detections.len()
    );

    Ok(HttpResponse::Ok().json(DetectResponse {
        message: "Detection completed successfully".to_string(),
        objects_detected: result.detections,
        inference_time: format!("{:.4}s", elapsed.as_secs_f64()),
        result_image_url: FileStore::url_for(Pool::Results, &result_name),
        original_image_url: stored.url(),
    }))
}

async fn get_result_image(
    service: web::Data<DetectionService>,
    filename: web::Path<String>,
) -> Result<NamedFile, ApiError> {
    let path = match service.store().resolve(Pool::Results, &filename) {
        Ok(Some(path)) => path,
        Ok(None) => return Err(ApiError::NotFound),
        Err(e) => {
            warn!("Rejected result lookup: {}", e);
            return Err(ApiError::NotFound);
        }
    };
    NamedFile::open_async(path).await.map_err(|_| ApiError::NotFound)
}

#[derive(Debug, Deserialize)]
struct TestImageQuery {
    #[serde(default = "default_width")]
    width: i64,
    #[serde(default = "default_height")]
    height: i64,
    #[serde(default = "default_num_shapes")]
    num_shapes: i64,
}

fn default_width() -> i64 {
    640
}

fn default_height() -> i64 {
    480
}

fn default_num_shapes() -> i64 {
    5
}

impl TestImageQuery {
    fn validate(&self) -> Result<(u32, u32, u32), ApiError> {
        let dimension = |name: &'static str, value: i64| {
            u32::try_from(value)
                .ok()
                .filter(|v| (1..=MAX_DIMENSION).contains(v))
                .ok_or_else(|| ApiError::InvalidParameter {
                    name,
                    reason: format!("must be between 1 and {}", MAX_DIMENSION),
                })
        };
        let width = dimension("width", self.width)?;
        let height = dimension("height", self.height)?;
        let num_shapes = u32::try_from(self.num_shapes)
            .ok()
            .filter(|n| *n <= MAX_SHAPES)
            .ok_or_else(|| ApiError::InvalidParameter {
                name: "num_shapes",
                reason: format!("must be between 0 and {}", MAX_SHAPES),
            })?;
        Ok((width, height, num_shapes))
    }
}

async fn create_test_image(
    service: web::Data<DetectionService>,
    query: web::Query<TestImageQuery>,
) -> Result<HttpResponse, ApiError> {
    let (width, height, num_shapes) = query.validate()?;
    let store = service.store().clone();
    let annotator = Arc::clone(service.annotator());

    let stored = web::block(move || {
        let mut rng = rand::rng();
        let image =
            synthetic::generate_test_image(width, height, num_shapes, &mut rng, annotator.font());
        store.save_jpeg(Pool::TestImages, &image, Some("test"))
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;
    info!("Generated {}x{} test image {}", width, height, stored.filename);

    Ok(HttpResponse::Ok().json(TestImageResponse {
        message: "Test image generated successfully".to_string(),
        image_url: stored.url(),
        width,
        height,
        num_shapes,
    }))
}

async fn test_api() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "message": "API is working"
    }))
}

async fn test_model(service: web::Data<DetectionService>) -> HttpResponse {
    HttpResponse::Ok().json(service.status().await)
}

async fn test_detect(service: web::Data<DetectionService>) -> Result<HttpResponse, ApiError> {
    let store = service.store().clone();
    let annotator = Arc::clone(service.annotator());
    let image = web::block(move || {
        let mut rng = rand::rng();
        let image = synthetic::generate_test_image(640, 480, 5, &mut rng, annotator.font());
        store
            .save_jpeg(Pool::TestImages, &image, Some("test_detect"))
            .map(|_| DynamicImage::ImageRgb8(image))
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    let start = Instant::now();
    let result: DetectionResult = service.detect(Arc::new(image), DEFAULT_CONFIDENCE, None).await;
    let elapsed = start.elapsed();

    let result_image_url = result
        .image_filename()
        .map(|name| FileStore::url_for(Pool::Results, &name));
    let (status, message) = if result_image_url.is_some() {
        ("success", "Detection test completed successfully")
    } else {
        ("error", "Detection test produced no annotated image")
    };

    Ok(HttpResponse::Ok().json(TestDetectResponse {
        status: status.to_string(),
        message: message.to_string(),
        inference_time: format!("{:.4}s", elapsed.as_secs_f64()),
        detections_count: result.detections.len(),
        result_image_url,
    }))
}
