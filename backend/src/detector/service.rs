use actix_web::web;
use image::DynamicImage;
use shared::{Detection, ModelStatus};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use super::{ClassFilter, ContourDetector, Detector, DetectorError, DetectorSettings};
use crate::annotate::Annotator;
use crate::storage::{FileStore, Pool};

/// Builds the primary detector. Called at most once per service.
pub type PrimaryLoader = Box<dyn Fn() -> Result<Arc<dyn Detector>, DetectorError> + Send + Sync>;

type LoadOutcome = Result<Arc<dyn Detector>, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Primary,
    Fallback,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorKind::Primary => write!(f, "primary"),
            DetectorKind::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
    /// Annotated image in the results pool; `None` if nothing could be saved.
    pub image_path: Option<PathBuf>,
    pub kind: DetectorKind,
}

impl DetectionResult {
    fn empty() -> Self {
        Self {
            detections: Vec::new(),
            image_path: None,
            kind: DetectorKind::Fallback,
        }
    }

    pub fn image_filename(&self) -> Option<String> {
        self.image_path
            .as_ref()
            .and_then(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
    }
}

/// Detection with failover: the primary detector is loaded lazily (once) and
/// any failure on the primary path is served by the contour fallback instead.
pub struct DetectionService {
    loader: Arc<PrimaryLoader>,
    primary: Arc<OnceLock<LoadOutcome>>,
    fallback: Arc<ContourDetector>,
    annotator: Arc<Annotator>,
    store: FileStore,
}

impl DetectionService {
    pub fn new(store: FileStore, annotator: Arc<Annotator>, loader: PrimaryLoader) -> Self {
        Self {
            loader: Arc::new(loader),
            primary: Arc::new(OnceLock::new()),
            fallback: Arc::new(ContourDetector::new()),
            annotator,
            store,
        }
    }

    /// Service whose primary detector is the libtorch model described by `settings`.
    pub fn with_settings(
        store: FileStore,
        annotator: Arc<Annotator>,
        settings: DetectorSettings,
    ) -> Self {
        let loader: PrimaryLoader = Box::new(move || super::load_primary(&settings));
        Self::new(store, annotator, loader)
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn annotator(&self) -> &Arc<Annotator> {
        &self.annotator
    }

    /// Loads the primary detector on first use. Concurrent callers share the
    /// single load attempt; its outcome is kept for the life of the service.
    ///
    /// The load runs to completion on the blocking pool even if the caller
    /// that started it goes away, so a dropped request never causes a reload.
    async fn primary(&self) -> LoadOutcome {
        if let Some(outcome) = self.primary.get() {
            return outcome.clone();
        }

        let cell = Arc::clone(&self.primary);
        let loader = Arc::clone(&self.loader);
        web::block(move || cell.get_or_init(|| load_outcome(&loader)).clone())
            .await
            .unwrap_or_else(|e| Err(format!("load aborted: {}", e)))
    }

    pub async fn status(&self) -> ModelStatus {
        let was_initialized = self.primary.get().is_some();
        let outcome = self.primary().await;
        ModelStatus {
            model_initialized: was_initialized,
            model_loaded: outcome.is_ok(),
            backend: match &outcome {
                Ok(detector) => detector.name().to_string(),
                Err(_) => self.fallback.name().to_string(),
            },
            load_error: outcome.err(),
        }
    }

    /// Never fails: the worst case is an empty result without an image.
    pub async fn detect(
        &self,
        image: Arc<DynamicImage>,
        confidence: f32,
        requested_classes: Option<Vec<i64>>,
    ) -> DetectionResult {
        let classes = ClassFilter::resolve(requested_classes.as_deref());
        log::info!(
            "Running detection with confidence threshold: {}, classes: {:?}",
            confidence,
            classes.ids()
        );

        match self.primary().await {
            Ok(primary) => {
                let job = self.job(primary, DetectorKind::Primary);
                let (image, classes) = (Arc::clone(&image), classes.clone());
                match web::block(move || job.run(&image, confidence, &classes)).await {
                    Ok(Ok(result)) => return result,
                    Ok(Err(e)) => log::warn!("Primary detection failed, falling back: {}", e),
                    Err(e) => log::error!("Primary detection aborted, falling back: {}", e),
                }
            }
            Err(reason) => log::debug!("Skipping primary detector: {}", reason),
        }

        self.detect_fallback(image, confidence, classes).await
    }

    pub async fn detect_fallback(
        &self,
        image: Arc<DynamicImage>,
        confidence: f32,
        classes: ClassFilter,
    ) -> DetectionResult {
        let fallback: Arc<dyn Detector> = self.fallback.clone();
        let job = self.job(fallback, DetectorKind::Fallback);
        match web::block(move || job.run(&image, confidence, &classes)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                log::error!("Fallback detection failed: {}", e);
                DetectionResult::empty()
            }
            Err(e) => {
                log::error!("Fallback detection aborted: {}", e);
                DetectionResult::empty()
            }
        }
    }

    fn job(&self, detector: Arc<dyn Detector>, kind: DetectorKind) -> DetectionJob {
        DetectionJob {
            detector,
            kind,
            annotator: Arc::clone(&self.annotator),
            store: self.store.clone(),
        }
    }
}

fn load_outcome(loader: &PrimaryLoader) -> LoadOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| (**loader)())) {
        Ok(Ok(detector)) => {
            log::info!("Primary detector '{}' loaded", detector.name());
            Ok(detector)
        }
        Ok(Err(e)) => {
            log::warn!("Primary detector unavailable, using fallback: {}", e);
            Err(e.to_string())
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            log::error!("Primary detector load panicked: {}", reason);
            Err(format!("load panicked: {}", reason))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| msg.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Everything one blocking detection run needs, owned so it can move onto the
/// blocking pool.
struct DetectionJob {
    detector: Arc<dyn Detector>,
    kind: DetectorKind,
    annotator: Arc<Annotator>,
    store: FileStore,
}

impl DetectionJob {
    fn run(
        &self,
        image: &DynamicImage,
        confidence: f32,
        classes: &ClassFilter,
    ) -> Result<DetectionResult, DetectorError> {
        let detections: Vec<Detection> = self
            .detector
            .detect(image, confidence, classes)?
            .into_iter()
            .filter(|det| classes.allows_id(i64::from(det.class_id)))
            .collect();

        let annotated = self.annotator.annotate(image, &detections);
        let tag = match self.kind {
            DetectorKind::Primary => None,
            DetectorKind::Fallback => Some("fallback"),
        };
        let stored = self.store.save_jpeg(Pool::Results, &annotated, tag)?;

        log::info!(
            "Detection completed by {} detector with {} objects found",
            self.detector.name(),
            detections.len()
        );
        Ok(DetectionResult {
            detections,
            image_path: Some(stored.path),
            kind: self.kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use image::{Rgb, RgbImage};
    use shared::{BoundingBox, SupportedClass};
    use actix_web::rt::time::timeout;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedDetector(Vec<Detection>);

    impl Detector for FixedDetector {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(
            &self,
            _image: &DynamicImage,
            _confidence: f32,
            _classes: &ClassFilter,
        ) -> Result<Vec<Detection>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(
            &self,
            _image: &DynamicImage,
            _confidence: f32,
            _classes: &ClassFilter,
        ) -> Result<Vec<Detection>, DetectorError> {
            Err(DetectorError::Inference("CUDA out of memory".into()))
        }
    }

    fn image() -> Arc<DynamicImage> {
        Arc::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            120,
            90,
            Rgb([30, 30, 30]),
        )))
    }

    fn loader<F>(f: F) -> PrimaryLoader
    where
        F: Fn() -> Result<Arc<dyn Detector>, DetectorError> + Send + Sync + 'static,
    {
        Box::new(f)
    }

    fn service(root: &std::path::Path, loader: PrimaryLoader) -> DetectionService {
        let store = FileStore::new(&StorageConfig::rooted_at(root));
        store.ensure_dirs().unwrap();
        DetectionService::new(store, Arc::new(Annotator::default()), loader)
    }

    fn results_count(root: &std::path::Path) -> usize {
        std::fs::read_dir(root.join("results")).unwrap().count()
    }

    #[actix_web::test]
    async fn primary_result_is_post_filtered_and_saved() {
        let tmp = tempfile::tempdir().unwrap();
        let dets = vec![
            Detection::new(
                SupportedClass::Person,
                0.9,
                BoundingBox::from_corners(1.0, 1.0, 20.0, 40.0),
            ),
            Detection::new(
                SupportedClass::Car,
                0.8,
                BoundingBox::from_corners(30.0, 30.0, 80.0, 60.0),
            ),
        ];
        let svc = service(
            tmp.path(),
            loader(move || Ok(Arc::new(FixedDetector(dets.clone())) as Arc<dyn Detector>)),
        );

        let result = svc.detect(image(), 0.25, Some(vec![2])).await;

        assert_eq!(result.kind, DetectorKind::Primary);
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].class_name, "car");
        let path = result.image_path.unwrap();
        assert!(path.starts_with(tmp.path().join("results")));
        assert_eq!(results_count(tmp.path()), 1);
    }

    #[actix_web::test]
    async fn load_failure_uses_fallback_and_is_attempted_once() {
        let tmp = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let svc = Arc::new(service(
            tmp.path(),
            loader(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DetectorError::Load("weights missing".into()))
            }),
        ));

        let calls = (0..8).map(|_| {
            let svc = Arc::clone(&svc);
            async move { svc.detect(image(), 0.25, None).await }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        for result in &results {
            assert_eq!(result.kind, DetectorKind::Fallback);
            assert!(result.image_path.is_some());
        }
        assert_eq!(results_count(tmp.path()), 8);

        let status = svc.status().await;
        assert!(status.model_initialized);
        assert!(!status.model_loaded);
        assert_eq!(status.backend, "contour");
        assert!(status.load_error.unwrap().contains("weights missing"));
    }

    #[actix_web::test]
    async fn abandoned_first_request_does_not_trigger_second_load() {
        let tmp = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let svc = service(
            tmp.path(),
            loader(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(300));
                Err(DetectorError::Load("slow weights".into()))
            }),
        );

        let abandoned = timeout(
            Duration::from_millis(50),
            svc.detect(image(), 0.25, None),
        )
        .await;
        assert!(abandoned.is_err());

        let result = svc.detect(image(), 0.25, None).await;

        assert_eq!(result.kind, DetectorKind::Fallback);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(svc.status().await.load_error.unwrap().contains("slow weights"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn inference_failure_falls_back_for_that_call() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(
            tmp.path(),
            loader(|| Ok(Arc::new(FailingDetector) as Arc<dyn Detector>)),
        );

        let result = svc.detect(image(), 0.25, None).await;

        assert_eq!(result.kind, DetectorKind::Fallback);
        assert!(result.image_filename().unwrap().ends_with("_fallback.jpg"));
        assert!(svc.status().await.model_loaded);
    }

    #[actix_web::test]
    async fn panicking_loader_degrades_to_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let svc = service(tmp.path(), loader(|| panic!("incompatible runtime")));

        let result = svc.detect(image(), 0.25, None).await;

        assert_eq!(result.kind, DetectorKind::Fallback);
        assert!(result.detections.is_empty());
        assert!(result.image_path.is_some());
        let status = svc.status().await;
        assert!(status.load_error.unwrap().contains("incompatible runtime"));
    }

    #[actix_web::test]
    async fn fallback_without_writable_pool_returns_empty_result() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not_a_dir");
        std::fs::write(&blocker, b"file in the way").unwrap();
        let store = FileStore::new(&StorageConfig::rooted_at(&blocker));
        let svc = DetectionService::new(
            store,
            Arc::new(Annotator::default()),
            loader(|| Err(DetectorError::Unavailable("no libtorch".into()))),
        );

        let result = svc.detect(image(), 0.25, None).await;

        assert!(result.detections.is_empty());
        assert!(result.image_path.is_none());
    }
}
