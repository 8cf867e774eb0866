//! Single-entry file cache for the last IP geolocation lookup.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// How long a cached lookup may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheExpiry {
    #[default]
    Never,
    After(TimeDelta),
}

impl CacheExpiry {
    fn is_expired(self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            CacheExpiry::Never => false,
            CacheExpiry::After(max_age) => now - fetched_at > max_age,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoCacheEntry {
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub fetched_at: DateTime<Utc>,
    /// Lookup service response as received.
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct GeoCache {
    path: PathBuf,
    expiry: CacheExpiry,
}

impl GeoCache {
    pub fn new(path: impl Into<PathBuf>, expiry: CacheExpiry) -> Self {
        Self {
            path: path.into(),
            expiry,
        }
    }

    pub fn default_path() -> Result<PathBuf> {
        let dirs = crate::settings::project_dirs()?;
        Ok(dirs.cache_dir().join("geolocation.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn expiry(&self) -> CacheExpiry {
        self.expiry
    }

    pub fn set_expiry(&mut self, expiry: CacheExpiry) {
        self.expiry = expiry;
    }

    /// The cached entry, or `None` when the file is missing, unreadable or
    /// expired.
    pub fn load(&self) -> Option<GeoCacheEntry> {
        self.load_at(Utc::now())
    }

    pub fn load_at(&self, now: DateTime<Utc>) -> Option<GeoCacheEntry> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "failed to read geolocation cache: {}", e);
                return None;
            }
        };

        let entry: GeoCacheEntry = match serde_json::from_str(&contents) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "ignoring corrupt geolocation cache: {}", e);
                return None;
            }
        };

        if self.expiry.is_expired(entry.fetched_at, now) {
            tracing::debug!(fetched_at = %entry.fetched_at, "geolocation cache expired");
            return None;
        }

        Some(entry)
    }

    /// Replaces the cache file with `entry`.
    pub fn store(&self, entry: &GeoCacheEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create cache directory: {}", parent.display())
            })?;
        }

        let json = serde_json::to_string_pretty(entry)
            .context("Failed to serialize geolocation cache entry")?;

        fs::write(&self.path, json).with_context(|| {
            format!("Failed to write geolocation cache: {}", self.path.display())
        })?;

        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to remove geolocation cache: {}", self.path.display())
            }),
        }
    }
}
