//! Configuration schema for a cache instance
//!
//! Every field has a default, so an empty TOML document is a valid config.

use crate::error::{CacheError, CacheResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Seven days, the ceiling applied to entries written by processes that later died
pub const DEFAULT_MAX_TTL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Heartbeats older than this classify their owner as dead
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 3000;

/// How often a waiting process re-lists the queue directory
pub const DEFAULT_QUEUE_POLL_INTERVAL_MS: u64 = 25;

/// Per-instance cache options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Root of the shared work directory (proc/, queue/, data/, staging/)
    pub workdir: PathBuf,

    /// Keep an in-process mirror of entries this process has seen
    pub use_mem_cache: bool,

    /// Persist entries to disk and coordinate with sibling processes
    pub use_file_cache: bool,

    /// Upper bound applied to every requested TTL, in milliseconds
    pub max_ttl_ms: u64,

    /// Age after which a heartbeat marks its process dead, in milliseconds
    pub heartbeat_timeout_ms: u64,

    /// Identity of this process in marker and entry files
    pub process_tag: Option<String>,

    /// Bounded poll interval used to detect queue directory changes
    pub queue_poll_interval_ms: u64,

    /// Delay at the end of init() so siblings can publish heartbeats.
    /// Defaults to one heartbeat timeout.
    pub startup_grace_ms: Option<u64>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            workdir: std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("tmp"),
            use_mem_cache: true,
            use_file_cache: true,
            max_ttl_ms: DEFAULT_MAX_TTL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            process_tag: None,
            queue_poll_interval_ms: DEFAULT_QUEUE_POLL_INTERVAL_MS,
            startup_grace_ms: None,
        }
    }
}

impl CacheOptions {
    /// Options rooted at `workdir`, everything else default
    pub fn with_workdir(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            ..Self::default()
        }
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self, source: &Path) -> CacheResult<()> {
        let invalid = |reason: &str| CacheError::ConfigInvalid {
            path: source.to_path_buf(),
            reason: reason.to_string(),
        };

        if self.heartbeat_timeout_ms == 0 {
            return Err(invalid("heartbeat_timeout_ms must be greater than zero"));
        }
        if self.queue_poll_interval_ms == 0 {
            return Err(invalid("queue_poll_interval_ms must be greater than zero"));
        }
        if !self.use_mem_cache && !self.use_file_cache {
            return Err(invalid(
                "at least one of use_mem_cache and use_file_cache must be enabled",
            ));
        }
        if self.workdir.as_os_str().is_empty() {
            return Err(invalid("workdir must not be empty"));
        }
        if let Some(tag) = &self.process_tag {
            validate_tag(tag)?;
        }
        Ok(())
    }

    /// The configured tag, or `<startMillis>.<pid>`
    pub fn resolved_tag(&self) -> String {
        self.process_tag
            .clone()
            .unwrap_or_else(|| format!("{}.{}", Utc::now().timestamp_millis(), std::process::id()))
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_millis(self.max_ttl_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// A third of the heartbeat timeout, rounded, never zero
    pub fn heartbeat_interval(&self) -> Duration {
        let millis = (self.heartbeat_timeout_ms + 1) / 3;
        Duration::from_millis(millis.max(1))
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms.unwrap_or(self.heartbeat_timeout_ms))
    }
}

/// A process tag names a heartbeat file, so it must be one safe path segment
pub fn validate_tag(tag: &str) -> CacheResult<()> {
    let unsafe_segment = tag.is_empty()
        || tag == "."
        || tag == ".."
        || tag.contains('/')
        || tag.contains('\\')
        || tag.contains('\0');
    if unsafe_segment {
        return Err(CacheError::InvalidTag(tag.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_deserializes_empty() {
        let options: CacheOptions = toml::from_str("").unwrap();
        assert!(options.use_mem_cache);
        assert!(options.use_file_cache);
        assert_eq!(options.max_ttl_ms, DEFAULT_MAX_TTL_MS);
        assert_eq!(options.heartbeat_timeout_ms, DEFAULT_HEARTBEAT_TIMEOUT_MS);
        assert!(options.workdir.ends_with("tmp"));
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            workdir = "/var/tmp/cache"
            heartbeat_timeout_ms = 900
            process_tag = "worker-1"
        "#;
        let options: CacheOptions = toml::from_str(toml).unwrap();
        assert_eq!(options.workdir, PathBuf::from("/var/tmp/cache"));
        assert_eq!(options.heartbeat_interval(), Duration::from_millis(300));
        assert_eq!(options.resolved_tag(), "worker-1");
        assert_eq!(options.max_ttl_ms, DEFAULT_MAX_TTL_MS); // default preserved
    }

    #[test]
    fn heartbeat_interval_rounds() {
        let mut options = CacheOptions::default();
        options.heartbeat_timeout_ms = 1000;
        assert_eq!(options.heartbeat_interval(), Duration::from_millis(333));
        options.heartbeat_timeout_ms = 2;
        assert_eq!(options.heartbeat_interval(), Duration::from_millis(1));
    }

    #[test]
    fn startup_grace_defaults_to_heartbeat_timeout() {
        let mut options = CacheOptions::default();
        assert_eq!(options.startup_grace(), options.heartbeat_timeout());
        options.startup_grace_ms = Some(0);
        assert_eq!(options.startup_grace(), Duration::ZERO);
    }

    #[test]
    fn default_tag_is_unique_per_process() {
        let tag = CacheOptions::default().resolved_tag();
        assert!(tag.ends_with(&format!(".{}", std::process::id())));
        assert!(validate_tag(&tag).is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let path = Path::new("test.toml");
        let mut options = CacheOptions::default();
        options.heartbeat_timeout_ms = 0;
        assert!(matches!(
            options.validate(path),
            Err(CacheError::ConfigInvalid { .. })
        ));

        let mut options = CacheOptions::default();
        options.use_mem_cache = false;
        options.use_file_cache = false;
        assert!(options.validate(path).is_err());

        let mut options = CacheOptions::default();
        options.process_tag = Some("a/b".to_string());
        assert!(matches!(
            options.validate(path),
            Err(CacheError::InvalidTag(_))
        ));
    }
}
