//! Configuration loading for cache instances

pub mod schema;

pub use schema::{validate_tag, CacheOptions};

use crate::error::{CacheError, CacheResult};
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// Loads `CacheOptions` from a TOML file
pub struct ConfigLoader {
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Create a loader for a specific file
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Load options, falling back to defaults when the file is missing
    pub async fn load(&self) -> CacheResult<CacheOptions> {
        if !self.config_path.exists() {
            debug!(
                "Config file {} not found, using defaults",
                self.config_path.display()
            );
            return Ok(CacheOptions::default());
        }

        self.load_required().await
    }

    /// Load options, failing when the file is missing
    pub async fn load_required(&self) -> CacheResult<CacheOptions> {
        let path = &self.config_path;
        if !path.exists() {
            return Err(CacheError::ConfigNotFound(path.clone()));
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| CacheError::io(format!("reading config from {}", path.display()), e))?;

        let options: CacheOptions =
            toml::from_str(&content).map_err(|e| CacheError::ConfigInvalid {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        options.validate(path)?;

        debug!("Loaded cache options from {}", path.display());
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_default_when_missing() {
        let temp = TempDir::new().unwrap();
        let loader = ConfigLoader::with_path(temp.path().join("nonexistent.toml"));

        let options = loader.load().await.unwrap();
        assert!(options.use_file_cache);
    }

    #[tokio::test]
    async fn load_required_fails_when_missing() {
        let temp = TempDir::new().unwrap();
        let loader = ConfigLoader::with_path(temp.path().join("nonexistent.toml"));

        let err = loader.load_required().await.unwrap_err();
        assert!(matches!(err, CacheError::ConfigNotFound(_)));
    }

    #[tokio::test]
    async fn load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.toml");
        fs::write(&path, "use_mem_cache = false\nmax_ttl_ms = 5000\n")
            .await
            .unwrap();

        let options = ConfigLoader::with_path(path).load().await.unwrap();
        assert!(!options.use_mem_cache);
        assert_eq!(options.max_ttl_ms, 5000);
    }

    #[tokio::test]
    async fn invalid_toml_reports_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.toml");
        fs::write(&path, "heartbeat_timeout_ms = \"soon\"").await.unwrap();

        let err = ConfigLoader::with_path(path.clone()).load().await.unwrap_err();
        match err {
            CacheError::ConfigInvalid { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other}"),
        }
    }
}
