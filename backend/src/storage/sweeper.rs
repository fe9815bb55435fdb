use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};

use crate::config::CleanupConfig;

/// Marker that keeps empty pool directories under version control.
pub const PLACEHOLDER: &str = ".gitkeep";

#[derive(Debug, Clone, Copy)]
pub struct SweepPolicy {
    pub max_age: Duration,
    pub max_files: usize,
    /// Files modified more recently than this are left alone entirely.
    pub grace: Duration,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::days(1),
            max_files: 100,
            grace: Duration::zero(),
        }
    }
}

impl SweepPolicy {
    pub fn startup(config: &CleanupConfig) -> Self {
        Self {
            max_age: Duration::try_hours(config.max_age_hours).unwrap_or(Duration::MAX),
            max_files: config.max_files,
            grace: Duration::zero(),
        }
    }

    pub fn periodic(config: &CleanupConfig) -> Self {
        Self {
            grace: Duration::try_seconds(config.grace_period_secs).unwrap_or(Duration::MAX),
            ..Self::startup(config)
        }
    }
}

#[derive(Debug)]
struct PoolEntry {
    path: PathBuf,
    modified: DateTime<Utc>,
}

pub fn sweep(dir: &Path, policy: &SweepPolicy) -> usize {
    sweep_at(dir, policy, Utc::now())
}

/// Removes entries older than `policy.max_age`, oldest first, then trims the
/// oldest survivors until at most `policy.max_files` remain.
pub fn sweep_at(dir: &Path, policy: &SweepPolicy, now: DateTime<Utc>) -> usize {
    if !dir.exists() {
        log::warn!("Directory {} does not exist, skipping cleanup", dir.display());
        return 0;
    }

    let mut entries = match list_entries(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!("Failed to list {}: {}", dir.display(), e);
            return 0;
        }
    };
    if policy.grace > Duration::zero() {
        entries.retain(|entry| now - entry.modified >= policy.grace);
    }

    if entries.is_empty() {
        log::info!("No files to clean in {}", dir.display());
        return 0;
    }

    entries.sort_by_key(|entry| entry.modified);

    let mut removed = 0;
    let mut survivors = Vec::with_capacity(entries.len());
    for entry in entries {
        let age = now - entry.modified;
        if age > policy.max_age && remove(&entry.path) {
            removed += 1;
            log::debug!(
                "Removed old file: {} (age: {:.1} days)",
                entry.path.display(),
                age.num_seconds() as f64 / 86_400.0
            );
            continue;
        }
        survivors.push(entry);
    }

    if survivors.len() > policy.max_files {
        let excess = survivors.len() - policy.max_files;
        for entry in survivors.iter().take(excess) {
            if remove(&entry.path) {
                removed += 1;
                log::debug!("Removed excess file: {}", entry.path.display());
            }
        }
    }

    if removed > 0 {
        log::info!("Cleaned up {} files from {}", removed, dir.display());
    }
    removed
}

fn list_entries(dir: &Path) -> std::io::Result<Vec<PoolEntry>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        if entry.file_name() == PLACEHOLDER {
            continue;
        }
        // the file may vanish between listing and stat
        let metadata = match entry.metadata() {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(e) => {
                log::warn!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };
        let modified = match metadata.modified().or_else(|_| metadata.created()) {
            Ok(time) => DateTime::<Utc>::from(time),
            Err(e) => {
                log::warn!("No timestamp for {}: {}", entry.path().display(), e);
                continue;
            }
        };
        entries.push(PoolEntry {
            path: entry.path(),
            modified,
        });
    }
    Ok(entries)
}

fn remove(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            log::error!("Error removing file {}: {}", path.display(), e);
            false
        }
    }
}
