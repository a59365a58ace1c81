//! In-process mirror of cache entries
//!
//! With disk backing, each mirrored entry remembers the size and modification
//! time of the file it came from. A lookup only answers when the file on disk
//! still carries that stamp, so the mirror never serves a value another
//! process has since replaced.

use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;
use tokio::fs;

/// Identity of one version of an entry file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    modified: SystemTime,
    len: u64,
}

impl FileStamp {
    /// Stamp of the file at `path`, `None` if it does not exist
    pub async fn of(path: &Path) -> CacheResult<Option<Self>> {
        match fs::metadata(path).await {
            Ok(meta) => {
                let modified = meta
                    .modified()
                    .map_err(|e| CacheError::io(format!("reading mtime of {}", path.display()), e))?;
                Ok(Some(Self {
                    modified,
                    len: meta.len(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(format!("inspecting {}", path.display()), e)),
        }
    }
}

#[derive(Debug, Clone)]
struct Mirrored {
    entry: CacheEntry,
    stamp: Option<FileStamp>,
}

/// Key to entry map, inert when disabled
#[derive(Debug)]
pub struct Mirror {
    enabled: bool,
    entries: Mutex<HashMap<String, Mirrored>>,
}

impl Mirror {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Mirrored entry, if it was recorded with exactly `stamp`
    pub fn lookup(&self, key: &str, stamp: FileStamp) -> Option<CacheEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|m| m.stamp == Some(stamp))
            .map(|m| m.entry.clone())
    }

    /// Mirrored entry regardless of disk state
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).map(|m| m.entry.clone())
    }

    pub fn store(&self, key: &str, entry: CacheEntry, stamp: Option<FileStamp>) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), Mirrored { entry, stamp });
    }

    pub fn invalidate(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
    }

    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lookup_requires_matching_stamp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("entry");
        fs::write(&path, "first").await.unwrap();
        let stamp = FileStamp::of(&path).await.unwrap().unwrap();

        let mirror = Mirror::new(true);
        let entry = CacheEntry::new(json!("v1"), None, "p");
        mirror.store("k", entry.clone(), Some(stamp));
        assert_eq!(mirror.lookup("k", stamp), Some(entry));

        fs::write(&path, "second, longer").await.unwrap();
        let changed = FileStamp::of(&path).await.unwrap().unwrap();
        assert_ne!(stamp, changed);
        assert!(mirror.lookup("k", changed).is_none());
    }

    #[tokio::test]
    async fn stamp_of_missing_file_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(FileStamp::of(&temp.path().join("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn disabled_mirror_stores_nothing() {
        let mirror = Mirror::new(false);
        mirror.store("k", CacheEntry::new(json!(1), None, "p"), None);
        assert!(mirror.keys().is_empty());
        assert!(mirror.get("k").is_none());
    }

    #[test]
    fn invalidate_and_keys() {
        let mirror = Mirror::new(true);
        mirror.store("a", CacheEntry::new(json!(1), None, "p"), None);
        mirror.store("b", CacheEntry::new(json!(2), None, "p"), None);
        mirror.invalidate("a");

        assert_eq!(mirror.keys(), vec!["b".to_string()]);
    }
}
