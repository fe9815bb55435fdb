use image::{ImageFormat, RgbImage};
use std::fs::OpenOptions;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::StorageConfig;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Invalid file name: {0}")]
    InvalidName(String),
}

/// One of the three size-bounded directories the service writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Uploads,
    Results,
    TestImages,
}

impl Pool {
    pub fn url_prefix(self) -> &'static str {
        match self {
            Pool::Uploads => "/static/uploads",
            Pool::Results => "/static/results",
            Pool::TestImages => "/static/test_images",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub pool: Pool,
    pub filename: String,
    pub path: PathBuf,
}

impl StoredFile {
    pub fn url(&self) -> String {
        FileStore::url_for(self.pool, &self.filename)
    }
}

#[derive(Clone, Debug)]
pub struct FileStore {
    uploads_dir: PathBuf,
    results_dir: PathBuf,
    test_images_dir: PathBuf,
}

impl FileStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            uploads_dir: config.uploads_dir.clone(),
            results_dir: config.results_dir.clone(),
            test_images_dir: config.test_images_dir.clone(),
        }
    }

    pub fn ensure_dirs(&self) -> Result<(), StorageError> {
        for dir in [&self.uploads_dir, &self.results_dir, &self.test_images_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn dir(&self, pool: Pool) -> &Path {
        match pool {
            Pool::Uploads => &self.uploads_dir,
            Pool::Results => &self.results_dir,
            Pool::TestImages => &self.test_images_dir,
        }
    }

    pub fn url_for(pool: Pool, filename: &str) -> String {
        format!("{}/{}", pool.url_prefix(), filename)
    }

    /// `<uuid-v4>[_<tag>][.<ext>]`
    pub fn generate_filename(tag: Option<&str>, extension: Option<&str>) -> String {
        let mut name = Uuid::new_v4().to_string();
        if let Some(tag) = tag {
            name.push('_');
            name.push_str(tag);
        }
        if let Some(ext) = extension.filter(|ext| !ext.is_empty()) {
            name.push('.');
            name.push_str(ext);
        }
        name
    }

    /// Keeps the original extension when there is a sane one, otherwise derives it
    /// from the declared content type.
    pub fn extension_for(original_name: Option<&str>, mime_type: &str) -> Option<String> {
        let from_name = original_name
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty() && ext.len() <= 8)
            .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|ext| ext.to_ascii_lowercase());

        from_name.or_else(|| {
            let ext = match mime_type {
                "image/jpeg" | "image/jpg" => "jpg",
                "image/png" => "png",
                "image/webp" => "webp",
                "image/gif" => "gif",
                "image/bmp" => "bmp",
                "image/tiff" => "tiff",
                _ => return None,
            };
            Some(ext.to_string())
        })
    }

    /// Writes the raw upload bytes, unmodified, under a fresh name.
    pub fn save_upload(
        &self,
        data: &[u8],
        original_name: Option<&str>,
        mime_type: &str,
    ) -> Result<StoredFile, StorageError> {
        let extension = Self::extension_for(original_name, mime_type);
        let filename = Self::generate_filename(None, extension.as_deref());
        self.write_new(Pool::Uploads, filename, data)
    }

    /// Encodes `image` as JPEG into `pool` under a fresh name.
    pub fn save_jpeg(
        &self,
        pool: Pool,
        image: &RgbImage,
        tag: Option<&str>,
    ) -> Result<StoredFile, StorageError> {
        let mut buffer = Vec::new();
        image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)?;
        let filename = Self::generate_filename(tag, Some("jpg"));
        self.write_new(pool, filename, &buffer)
    }

    fn write_new(
        &self,
        pool: Pool,
        filename: String,
        data: &[u8],
    ) -> Result<StoredFile, StorageError> {
        let dir = self.dir(pool);
        std::fs::create_dir_all(dir)?;
        let path = dir.join(&filename);

        // create_new: an existing file is never overwritten
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(data)?;
        file.flush()?;

        log::debug!("Stored {} bytes at {}", data.len(), path.display());
        Ok(StoredFile {
            pool,
            filename,
            path,
        })
    }

    /// Resolves a client-supplied filename inside `pool`. Names that could escape
    /// the pool directory are rejected.
    pub fn resolve(&self, pool: Pool, filename: &str) -> Result<Option<PathBuf>, StorageError> {
        let valid = !filename.is_empty()
            && !filename.starts_with('.')
            && !filename.contains(['/', '\\'])
            && !filename.contains("..");
        if !valid {
            return Err(StorageError::InvalidName(filename.to_string()));
        }

        let path = self.dir(pool).join(filename);
        Ok(path.is_file().then_some(path))
    }
}
