//! Cache operations against the data directory
//!
//! Everything here assumes the caller holds the queue turn, so a
//! read-modify-write sees no concurrent writer.

use crate::clock::now_millis;
use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::layout::{list_names, remove_if_exists, unescape_key, WorkLayout};
use crate::store::merge::{append_value, remove_value, AppendOptions, RemoveOptions};
use crate::store::mirror::{FileStamp, Mirror};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

pub(crate) struct DiskOps {
    layout: WorkLayout,
    staging: PathBuf,
    process_tag: String,
    max_ttl: Duration,
}

impl DiskOps {
    pub fn new(layout: WorkLayout, process_tag: &str, max_ttl: Duration) -> Self {
        Self {
            staging: layout.staging_for(process_tag),
            layout,
            process_tag: process_tag.to_string(),
            max_ttl,
        }
    }

    /// Create the work directory tree if it does not exist yet
    pub async fn prepare(&self) -> CacheResult<()> {
        self.layout.ensure().await
    }

    /// Unexpired entry for `key`; an expired file is deleted on the way
    pub async fn get(&self, key: &str, mirror: &Mirror) -> CacheResult<Option<CacheEntry>> {
        let path = self.layout.entry_path(key)?;
        let Some(stamp) = FileStamp::of(&path).await? else {
            mirror.invalidate(key);
            return Ok(None);
        };

        let entry = match mirror.lookup(key, stamp) {
            Some(entry) => entry,
            None => match CacheEntry::load(&path).await? {
                Some(entry) => entry,
                None => {
                    mirror.invalidate(key);
                    return Ok(None);
                }
            },
        };

        if entry.is_expired(self.max_ttl) {
            remove_if_exists(&path).await?;
            mirror.invalidate(key);
            debug!("Expired [{}] on read", key);
            return Ok(None);
        }

        mirror.store(key, entry.clone(), Some(stamp));
        Ok(Some(entry))
    }

    pub async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        mirror: &Mirror,
    ) -> CacheResult<CacheEntry> {
        let path = self.layout.entry_path(key)?;
        let entry = CacheEntry::new(value, ttl, &self.process_tag);
        self.persist(key, &path, &entry, mirror).await?;
        debug!("[{}] is cached in file", key);
        Ok(entry)
    }

    pub async fn reset(&self, key: &str, mirror: &Mirror) -> CacheResult<()> {
        let path = self.layout.entry_path(key)?;
        mirror.invalidate(key);
        if remove_if_exists(&path).await? {
            debug!("Reset [{}]", key);
        }
        Ok(())
    }

    /// Merge `value` into the current (or initial) value and persist it
    pub async fn append(
        &self,
        key: &str,
        value: Value,
        options: AppendOptions,
        mirror: &Mirror,
    ) -> CacheResult<CacheEntry> {
        let path = self.layout.entry_path(key)?;
        let base = match self.get(key, mirror).await? {
            Some(current) => current.data,
            None => options.initial_value.unwrap_or_else(|| Value::Array(Vec::new())),
        };

        let merged = append_value(base, value)?;
        let entry = CacheEntry::new(merged, options.ttl, &self.process_tag);
        self.persist(key, &path, &entry, mirror).await?;
        Ok(entry)
    }

    /// Remove `item` from the stored value; `None` if the key is absent.
    ///
    /// The entry keeps its original arrival time and TTL.
    pub async fn remove(
        &self,
        key: &str,
        item: &Value,
        options: &RemoveOptions,
        mirror: &Mirror,
    ) -> CacheResult<Option<CacheEntry>> {
        let path = self.layout.entry_path(key)?;
        let Some(mut entry) = self.get(key, mirror).await? else {
            return Ok(None);
        };

        entry.data = remove_value(entry.data, item, options)?;
        self.persist(key, &path, &entry, mirror).await?;
        Ok(Some(entry))
    }

    /// Delete the entry only if it is still the write that arrived at `arrive_at`
    pub async fn expire_if_unchanged(
        &self,
        key: &str,
        arrive_at: i64,
        mirror: &Mirror,
    ) -> CacheResult<bool> {
        let path = self.layout.entry_path(key)?;
        let unchanged = CacheEntry::load(&path).await?.is_some_and(|entry| {
            entry.arrive_at == arrive_at && entry.process_tag == self.process_tag
        });
        if !unchanged {
            return Ok(false);
        }

        mirror.invalidate(key);
        remove_if_exists(&path).await
    }

    /// Original key names of every entry file, expired or not
    pub async fn keys(&self) -> CacheResult<Vec<String>> {
        let names = list_names(&self.layout.data_dir).await?;
        Ok(names.iter().map(|name| unescape_key(name)).collect())
    }

    /// Delete expired entries whose owner is not in `alive`.
    ///
    /// A corrupt entry aborts the sweep unless it vanished meanwhile.
    pub async fn sweep(&self, alive: &HashSet<String>) -> CacheResult<usize> {
        let now = now_millis();
        let mut removed = 0;

        for name in list_names(&self.layout.data_dir).await? {
            let path = self.layout.data_dir.join(&name);
            let entry = match CacheEntry::load(&path).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e @ CacheError::CorruptEntry { .. }) => {
                    if fs::try_exists(&path).await.unwrap_or(true) {
                        return Err(e);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !alive.contains(&entry.process_tag) && entry.is_expired_at(now, self.max_ttl) {
                if remove_if_exists(&path).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn persist(
        &self,
        key: &str,
        path: &Path,
        entry: &CacheEntry,
        mirror: &Mirror,
    ) -> CacheResult<()> {
        mirror.invalidate(key);
        entry.save(&self.staging, path).await?;
        if mirror.is_enabled() {
            let stamp = FileStamp::of(path).await?;
            mirror.store(key, entry.clone(), stamp);
        }
        Ok(())
    }
}
