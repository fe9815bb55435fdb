use actix_web::http::StatusCode;
use actix_web::http::header::CONTENT_TYPE;
use actix_web::{App, test, web};
use detection_backend::annotate::Annotator;
use detection_backend::config::StorageConfig;
use detection_backend::detector::{
    ClassFilter, DetectionService, Detector, DetectorError, PrimaryLoader,
};
use detection_backend::routes::configure_routes;
use detection_backend::storage::FileStore;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use shared::{BoundingBox, Detection, SupportedClass};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

const BOUNDARY: &str = "detection-test-boundary";
const UPLOAD_LIMIT: usize = 5 * 1024 * 1024;

macro_rules! init_app {
    ($service:expr, $storage:expr) => {{
        let storage: StorageConfig = $storage.clone();
        test::init_service(
            App::new()
                .app_data($service.clone())
                .configure(move |cfg| configure_routes(cfg, &storage, UPLOAD_LIMIT)),
        )
        .await
    }};
}

struct Fixed;

impl Detector for Fixed {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn detect(
        &self,
        _image: &DynamicImage,
        _confidence: f32,
        _classes: &ClassFilter,
    ) -> Result<Vec<Detection>, DetectorError> {
        Ok(vec![
            Detection::new(
                SupportedClass::Person,
                0.91,
                BoundingBox::from_corners(10.0, 12.0, 40.0, 90.0),
            ),
            // a COCO class outside the supported set
            Detection {
                class_id: 3,
                class_name: "motorcycle".to_string(),
                confidence: 0.88,
                bbox: BoundingBox::from_corners(50.0, 50.0, 90.0, 80.0),
            },
            Detection::new(
                SupportedClass::Truck,
                0.64,
                BoundingBox::from_corners(100.0, 20.0, 150.0, 70.0),
            ),
        ])
    }
}

struct Broken;

impl Detector for Broken {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn detect(
        &self,
        _image: &DynamicImage,
        _confidence: f32,
        _classes: &ClassFilter,
    ) -> Result<Vec<Detection>, DetectorError> {
        Err(DetectorError::Inference("device lost".to_string()))
    }
}

struct Panicking;

impl Detector for Panicking {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn detect(
        &self,
        _image: &DynamicImage,
        _confidence: f32,
        _classes: &ClassFilter,
    ) -> Result<Vec<Detection>, DetectorError> {
        panic!("index out of bounds in postprocess")
    }
}

fn loader<F>(f: F) -> PrimaryLoader
where
    F: Fn() -> Result<Arc<dyn Detector>, DetectorError> + Send + Sync + 'static,
{
    Box::new(f)
}

fn failing_loader() -> PrimaryLoader {
    loader(|| Err(DetectorError::Load("weights not found".to_string())))
}

fn setup(root: &Path, primary: PrimaryLoader) -> (web::Data<DetectionService>, StorageConfig) {
    let storage = StorageConfig::rooted_at(root);
    let store = FileStore::new(&storage);
    store.ensure_dirs().unwrap();
    let service = DetectionService::new(store, Arc::new(Annotator::default()), primary);
    (web::Data::new(service), storage)
}

fn png_with_squares() -> Vec<u8> {
    let mut image = RgbImage::from_pixel(200, 160, Rgb([0, 0, 0]));
    for (x0, y0) in [(20u32, 20u32), (120, 80)] {
        for y in y0..y0 + 50 {
            for x in x0..x0 + 50 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
    }
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

enum Part<'a> {
    File {
        filename: &'a str,
        content_type: &'a str,
        data: &'a [u8],
    },
    Text {
        name: &'a str,
        value: &'a str,
    },
}

fn multipart_body(parts: &[Part]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::File {
                filename,
                content_type,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        filename, content_type
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
            Part::Text { name, value } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}",
                        name, value
                    )
                    .as_bytes(),
                );
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn detect_request(parts: &[Part]) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/detect")
        .insert_header((
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        ))
        .set_payload(multipart_body(parts))
}

fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name() != ".gitkeep")
        .count()
}

fn assert_well_formed(objects: &[Value]) {
    for obj in objects {
        let class_id = obj["class_id"].as_u64().unwrap();
        assert!([0, 2, 5, 7].contains(&class_id), "unexpected class {}", class_id);
        let bbox = &obj["bbox"];
        let (x1, y1) = (bbox["x1"].as_f64().unwrap(), bbox["y1"].as_f64().unwrap());
        let (x2, y2) = (bbox["x2"].as_f64().unwrap(), bbox["y2"].as_f64().unwrap());
        assert!(x2 >= x1 && y2 >= y1);
        assert_eq!(bbox["width"].as_f64().unwrap(), x2 - x1);
        assert_eq!(bbox["height"].as_f64().unwrap(), y2 - y1);
    }
}

#[actix_web::test]
async fn text_upload_is_rejected_without_writing() {
    let tmp = tempfile::tempdir().unwrap();
    let (service, storage) = setup(tmp.path(), failing_loader());
    let app = init_app!(service, storage);

    let req = detect_request(&[Part::File {
        filename: "notes.txt",
        content_type: "text/plain",
        data: b"hello",
    }])
    .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "Uploaded file is not an image");
    assert_eq!(file_count(&storage.uploads_dir), 0);
}

#[actix_web::test]
async fn invalid_requests_are_bad_requests() {
    let tmp = tempfile::tempdir().unwrap();
    let (service, storage) = setup(tmp.path(), failing_loader());
    let app = init_app!(service, storage);
    let png = png_with_squares();

    let cases = [
        vec![Part::Text {
            name: "conf",
            value: "0.5",
        }],
        vec![
            Part::File {
                filename: "a.png",
                content_type: "image/png",
                data: &png,
            },
            Part::Text {
                name: "conf",
                value: "1.7",
            },
        ],
        vec![Part::File {
            filename: "broken.png",
            content_type: "image/png",
            data: b"\x89PNG not really",
        }],
    ];
    for parts in &cases {
        let resp = test::call_service(&app, detect_request(parts).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
    assert_eq!(file_count(&storage.uploads_dir), 0);
    assert_eq!(file_count(&storage.results_dir), 0);
}

#[actix_web::test]
async fn failed_primary_load_still_serves_detections() {
    let tmp = tempfile::tempdir().unwrap();
    let (service, storage) = setup(tmp.path(), failing_loader());
    let app = init_app!(service, storage);
    let png = png_with_squares();

    let req = detect_request(&[
        Part::File {
            filename: "street.png",
            content_type: "image/png",
            data: &png,
        },
        Part::Text {
            name: "conf",
            value: "0.4",
        },
    ])
    .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["message"], "Detection completed successfully");
    assert_well_formed(body["objects_detected"].as_array().unwrap());
    assert!(body["inference_time"].as_str().unwrap().ends_with('s'));

    let original = body["original_image_url"].as_str().unwrap();
    let original_name = original.strip_prefix("/static/uploads/").unwrap();
    assert!(original_name.ends_with(".png"));
    assert_eq!(
        std::fs::read(storage.uploads_dir.join(original_name)).unwrap(),
        png
    );

    let result = body["result_image_url"].as_str().unwrap();
    let result_name = result.strip_prefix("/static/results/").unwrap();
    assert!(storage.results_dir.join(result_name).is_file());

    let served = test::call_service(
        &app,
        test::TestRequest::get()
            .uri(&format!("/result/{}", result_name))
            .to_request(),
    )
    .await;
    assert_eq!(served.status(), StatusCode::OK);
}

#[actix_web::test]
async fn deterministic_primary_gives_identical_filtered_results() {
    let tmp = tempfile::tempdir().unwrap();
    let (service, storage) = setup(
        tmp.path(),
        loader(|| Ok(Arc::new(Fixed) as Arc<dyn Detector>)),
    );
    let app = init_app!(service, storage);
    let png = png_with_squares();

    let mut responses = Vec::new();
    for _ in 0..2 {
        let req = detect_request(&[Part::File {
            filename: "frame.png",
            content_type: "image/png",
            data: &png,
        }])
        .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        responses.push(body);
    }

    let first = responses[0]["objects_detected"].as_array().unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0]["class_name"], "person");
    assert_eq!(first[1]["class_name"], "truck");
    assert_well_formed(first);
    assert_eq!(responses[0]["objects_detected"], responses[1]["objects_detected"]);
    assert_ne!(responses[0]["result_image_url"], responses[1]["result_image_url"]);
}

#[actix_web::test]
async fn class_filter_restricts_primary_output() {
    let tmp = tempfile::tempdir().unwrap();
    let (service, storage) = setup(
        tmp.path(),
        loader(|| Ok(Arc::new(Fixed) as Arc<dyn Detector>)),
    );
    let app = init_app!(service, storage);
    let png = png_with_squares();

    let req = detect_request(&[
        Part::File {
            filename: "frame.png",
            content_type: "image/png",
            data: &png,
        },
        Part::Text {
            name: "classes",
            value: "7",
        },
        Part::Text {
            name: "classes",
            value: "bike",
        },
    ])
    .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;

    let objects = body["objects_detected"].as_array().unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0]["class_id"], 7);
}

#[actix_web::test]
async fn inference_failures_fall_back() {
    let loaders = [
        loader(|| Ok(Arc::new(Broken) as Arc<dyn Detector>)),
        loader(|| Ok(Arc::new(Panicking) as Arc<dyn Detector>)),
    ];
    let png = png_with_squares();

    for primary in loaders {
        let tmp = tempfile::tempdir().unwrap();
        let (service, storage) = setup(tmp.path(), primary);
        let app = init_app!(service, storage);

        let req = detect_request(&[Part::File {
            filename: "frame.png",
            content_type: "image/png",
            data: &png,
        }])
        .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_well_formed(body["objects_detected"].as_array().unwrap());
        assert!(
            body["result_image_url"]
                .as_str()
                .unwrap()
                .ends_with("_fallback.jpg")
        );
    }
}

#[actix_web::test]
async fn generates_test_image_with_requested_size() {
    let tmp = tempfile::tempdir().unwrap();
    let (service, storage) = setup(tmp.path(), failing_loader());
    let app = init_app!(service, storage);

    let req = test::TestRequest::post()
        .uri("/generate-test-image?width=320&height=240&num_shapes=3")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;

    assert_eq!(body["width"], 320);
    assert_eq!(body["height"], 240);
    assert_eq!(body["num_shapes"], 3);
    let name = body["image_url"]
        .as_str()
        .unwrap()
        .strip_prefix("/static/test_images/")
        .unwrap()
        .to_string();
    let dims = image::image_dimensions(storage.test_images_dir.join(name)).unwrap();
    assert_eq!(dims, (320, 240));

    let too_wide = test::TestRequest::get()
        .uri("/generate-test-image?width=5000")
        .to_request();
    assert_eq!(
        test::call_service(&app, too_wide).await.status(),
        StatusCode::BAD_REQUEST
    );
}

#[actix_web::test]
async fn missing_result_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let (service, storage) = setup(tmp.path(), failing_loader());
    let app = init_app!(service, storage);

    for uri in ["/result/nothing-here.jpg", "/result/..secret"] {
        let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "Result image not found");
    }
}

#[actix_web::test]
async fn diagnostics_report_service_state() {
    let tmp = tempfile::tempdir().unwrap();
    let (service, storage) = setup(tmp.path(), failing_loader());
    let app = init_app!(service, storage);

    let info: Value =
        test::call_and_read_body_json(&app, test::TestRequest::get().uri("/api").to_request())
            .await;
    assert_eq!(info["supported_classes"].as_array().unwrap().len(), 4);
    assert_eq!(info["endpoints"]["detect"], "/detect");

    let alive: Value =
        test::call_and_read_body_json(&app, test::TestRequest::get().uri("/test").to_request())
            .await;
    assert_eq!(alive["status"], "ok");

    let model: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get().uri("/test-model").to_request(),
    )
    .await;
    assert_eq!(model["model_loaded"], false);
    assert_eq!(model["backend"], "contour");
    assert!(
        model["load_error"]
            .as_str()
            .unwrap()
            .contains("weights not found")
    );

    let run: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get().uri("/test-detect").to_request(),
    )
    .await;
    assert_eq!(run["status"], "success");
    assert_eq!(file_count(&storage.test_images_dir), 1);
    assert_eq!(file_count(&storage.results_dir), 1);
}
