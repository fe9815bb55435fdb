use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/detection.yaml";

// Upper bounds keep the derived durations well inside chrono's range.
const MAX_AGE_HOURS: i64 = 24 * 365 * 10;
const MAX_GRACE_SECS: i64 = 24 * 60 * 60;
const MAX_INTERVAL_MINUTES: u64 = 60 * 24 * 7;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid YAML in config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub cleanup: CleanupConfig,
    pub detector: DetectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub static_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub results_dir: PathBuf,
    pub test_images_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub max_age_hours: i64,
    pub max_files: usize,
    pub grace_period_secs: i64,
    pub interval_minutes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    pub device: String,
    pub image_size: u32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    /// Class scores per prediction in the exported head (80 for COCO).
    pub num_classes: usize,
    pub font_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::rooted_at("static")
    }
}

impl StorageConfig {
    /// Lays the three pools out under a single static directory.
    pub fn rooted_at(static_dir: impl Into<PathBuf>) -> Self {
        let static_dir = static_dir.into();
        Self {
            uploads_dir: static_dir.join("uploads"),
            results_dir: static_dir.join("results"),
            test_images_dir: static_dir.join("test_images"),
            static_dir,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_age_hours: 24,
            max_files: 100,
            grace_period_secs: 30,
            interval_minutes: None,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/yolov8n.torchscript"),
            device: "auto".to_string(),
            image_size: 640,
            iou_threshold: 0.45,
            max_detections: 300,
            num_classes: 80,
            font_path: None,
        }
    }
}

impl AppConfig {
    /// Reads the YAML file named by `APP_CONFIG` (or the default path) and
    /// applies environment overrides. A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("APP_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = Path::new(&path);

        let mut config = if path.exists() {
            log::info!("Loading configuration from {}", path.display());
            Self::from_path(path)?
        } else {
            log::warn!(
                "Config file {} not found, using built-in defaults",
                path.display()
            );
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(config_str)?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: "server.port",
                reason: format!("'{}' is not a port number", port),
            })?;
        }
        if let Some(static_dir) = lookup("STATIC_DIR") {
            self.storage = StorageConfig::rooted_at(static_dir);
        }
        if let Some(model_path) = lookup("MODEL_PATH") {
            self.detector.model_path = PathBuf::from(model_path);
        }
        if let Some(device) = lookup("MODEL_DEVICE") {
            self.detector.device = device;
        }
        if let Some(font_path) = lookup("FONT_PATH") {
            self.detector.font_path = Some(PathBuf::from(font_path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.port",
                reason: "must be non-zero".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.detector.iou_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "detector.iou_threshold",
                reason: format!("{} is outside [0, 1]", self.detector.iou_threshold),
            });
        }
        if self.detector.image_size == 0 || self.detector.image_size % 32 != 0 {
            return Err(ConfigError::InvalidValue {
                field: "detector.image_size",
                reason: format!("{} is not a positive multiple of 32", self.detector.image_size),
            });
        }
        self.device().map_err(|reason| ConfigError::InvalidValue {
            field: "detector.device",
            reason,
        })?;
        if !(0..=MAX_AGE_HOURS).contains(&self.cleanup.max_age_hours) {
            return Err(ConfigError::InvalidValue {
                field: "cleanup.max_age_hours",
                reason: format!("must be between 0 and {}", MAX_AGE_HOURS),
            });
        }
        if !(0..=MAX_GRACE_SECS).contains(&self.cleanup.grace_period_secs) {
            return Err(ConfigError::InvalidValue {
                field: "cleanup.grace_period_secs",
                reason: format!("must be between 0 and {}", MAX_GRACE_SECS),
            });
        }
        if self
            .cleanup
            .interval_minutes
            .is_some_and(|minutes| minutes > MAX_INTERVAL_MINUTES)
        {
            return Err(ConfigError::InvalidValue {
                field: "cleanup.interval_minutes",
                reason: format!("must be at most {}", MAX_INTERVAL_MINUTES),
            });
        }
        if self.detector.num_classes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "detector.num_classes",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn device(&self) -> Result<DevicePreference, String> {
        DevicePreference::parse(&self.detector.device)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    Auto,
    Cpu,
    Cuda(usize),
}

impl DevicePreference {
    pub fn parse(value: &str) -> Result<Self, String> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|idx| idx.parse().ok())
                .map(Self::Cuda)
                .ok_or_else(|| format!("unknown device '{}'", other)),
        }
    }
}
