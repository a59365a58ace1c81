//! Cache store
//!
//! Public key/value API. With disk backing every operation runs as a job on
//! the operation queue, so reads and read-modify-writes see one writer at a
//! time across all processes sharing the work directory. Without disk
//! backing the store is a plain in-process map with the same TTL rules.

mod disk;
pub mod merge;
pub mod mirror;

pub use merge::{AppendOptions, MatchMode, RemoveKind, RemoveOptions};
pub use mirror::Mirror;

use crate::config::CacheOptions;
use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::layout::{escape_key, WorkLayout};
use crate::queue::{FileOperationQueue, Job, JobQueue};
use disk::DiskOps;
use futures_util::FutureExt;
use merge::{append_value, remove_value};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

/// Handle to a cache instance; clones share the same state
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    process_tag: String,
    max_ttl: Duration,
    mirror: Mirror,
    disk: DiskOps,
    /// `None` when the store keeps entries in memory only
    queue: Option<Arc<dyn JobQueue>>,
    initialized: AtomicBool,
    /// Serialises read-modify-write in memory-only mode
    memory_turn: Mutex<()>,
    /// Id of the latest local write per key that still awaits eviction
    writes: Mutex<HashMap<String, u64>>,
    next_write: AtomicU64,
    stop: watch::Sender<bool>,
}

impl CacheStore {
    /// Build a store from options, with a filesystem queue when disk backing is on
    pub fn new(options: CacheOptions) -> CacheResult<Self> {
        options.validate(Path::new("<options>"))?;

        let mut options = options;
        options.process_tag = Some(options.resolved_tag());

        let queue: Option<Arc<dyn JobQueue>> = if options.use_file_cache {
            Some(Arc::new(FileOperationQueue::new(&options)?))
        } else {
            None
        };
        Ok(Self::assemble(&options, queue))
    }

    /// Build a disk-backed store over a caller-supplied queue
    pub fn with_queue(options: CacheOptions, queue: Arc<dyn JobQueue>) -> CacheResult<Self> {
        options.validate(Path::new("<options>"))?;

        let mut options = options;
        options.process_tag = Some(queue.process_tag().to_string());
        Ok(Self::assemble(&options, Some(queue)))
    }

    fn assemble(options: &CacheOptions, queue: Option<Arc<dyn JobQueue>>) -> Self {
        let process_tag = options.resolved_tag();
        let max_ttl = options.max_ttl();
        let (stop, _) = watch::channel(false);

        Self {
            inner: Arc::new(StoreInner {
                disk: DiskOps::new(WorkLayout::new(&options.workdir), &process_tag, max_ttl),
                mirror: Mirror::new(options.use_mem_cache),
                process_tag,
                max_ttl,
                queue,
                initialized: AtomicBool::new(false),
                memory_turn: Mutex::new(()),
                writes: Mutex::new(HashMap::new()),
                next_write: AtomicU64::new(1),
                stop,
            }),
        }
    }

    /// Start the queue and heartbeat, then sweep orphaned expired entries.
    ///
    /// Returns this process's tag.
    pub async fn init(&self) -> CacheResult<String> {
        if let Some(queue) = &self.inner.queue {
            self.inner.disk.prepare().await?;
            queue.init().await?;
            let removed = self.inner.sweep().await?;
            if removed > 0 {
                info!("Swept {} orphaned cache entries at startup", removed);
            }
        }
        self.inner.stop.send_replace(false);
        self.inner.initialized.store(true, Ordering::Release);

        info!("Cache store ready as {}", self.inner.process_tag);
        Ok(self.inner.process_tag.clone())
    }

    pub fn process_tag(&self) -> &str {
        &self.inner.process_tag
    }

    pub fn is_disk_backed(&self) -> bool {
        self.inner.queue.is_some()
    }

    /// Current value of `key`, or `None` if absent or expired
    pub async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        self.ensure_ready()?;
        if self.inner.queue.is_none() {
            return Ok(self.inner.memory_get(key).map(|entry| entry.data));
        }

        let key = key.to_string();
        let entry = self
            .inner
            .turn("get", move |inner: Arc<StoreInner>| async move {
                inner.disk.get(&key, &inner.mirror).await
            })
            .await?;
        Ok(entry.map(|entry| entry.data))
    }

    /// Store `value`; a positive `ttl` also schedules eviction once it elapses
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> CacheResult<()> {
        self.ensure_ready()?;
        let (entry, write) = if self.inner.queue.is_none() {
            escape_key(key)?;
            let _turn = self
                .inner
                .memory_turn
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let entry = CacheEntry::new(value, ttl, &self.inner.process_tag);
            self.inner.mirror.store(key, entry.clone(), None);
            (entry, self.inner.record_write(key, ttl))
        } else {
            let owned = key.to_string();
            self.inner
                .turn("set", move |inner: Arc<StoreInner>| async move {
                    let entry = inner.disk.set(&owned, value, ttl, &inner.mirror).await?;
                    let write = inner.record_write(&owned, ttl);
                    Ok::<_, CacheError>((entry, write))
                })
                .await?
        };

        self.inner.schedule_eviction(key, &entry, ttl, write);
        Ok(())
    }

    /// Delete `key`; succeeds whether or not it existed
    pub async fn reset(&self, key: &str) -> CacheResult<()> {
        self.ensure_ready()?;
        if self.inner.queue.is_none() {
            self.inner.mirror.invalidate(key);
            return Ok(());
        }

        let key = key.to_string();
        self.inner
            .turn("reset", move |inner: Arc<StoreInner>| async move {
                inner.disk.reset(&key, &inner.mirror).await
            })
            .await
    }

    /// Append to a sequence or merge into a mapping; returns the merged value
    pub async fn append(
        &self,
        key: &str,
        value: Value,
        options: AppendOptions,
    ) -> CacheResult<Value> {
        self.ensure_ready()?;
        let ttl = options.ttl;
        let (entry, write) = if self.inner.queue.is_none() {
            escape_key(key)?;
            let _turn = self
                .inner
                .memory_turn
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let base = match self.inner.memory_get(key) {
                Some(current) => current.data,
                None => options.initial_value.unwrap_or_else(|| Value::Array(Vec::new())),
            };
            let entry = CacheEntry::new(append_value(base, value)?, ttl, &self.inner.process_tag);
            self.inner.mirror.store(key, entry.clone(), None);
            (entry, self.inner.record_write(key, ttl))
        } else {
            let owned = key.to_string();
            self.inner
                .turn("append", move |inner: Arc<StoreInner>| async move {
                    let entry = inner.disk.append(&owned, value, options, &inner.mirror).await?;
                    let write = inner.record_write(&owned, ttl);
                    Ok::<_, CacheError>((entry, write))
                })
                .await?
        };

        self.inner.schedule_eviction(key, &entry, ttl, write);
        Ok(entry.data)
    }

    /// Remove an element or field; returns the new value, `None` if `key` was absent
    pub async fn remove(
        &self,
        key: &str,
        item: Value,
        options: RemoveOptions,
    ) -> CacheResult<Option<Value>> {
        self.ensure_ready()?;
        if self.inner.queue.is_none() {
            let _turn = self
                .inner
                .memory_turn
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(mut entry) = self.inner.memory_get(key) else {
                return Ok(None);
            };
            entry.data = remove_value(entry.data, &item, &options)?;
            self.inner.mirror.store(key, entry.clone(), None);
            return Ok(Some(entry.data));
        }

        let key = key.to_string();
        let entry = self
            .inner
            .turn("remove", move |inner: Arc<StoreInner>| async move {
                inner.disk.remove(&key, &item, &options, &inner.mirror).await
            })
            .await?;
        Ok(entry.map(|entry| entry.data))
    }

    /// Every stored key, including entries that have expired but not yet been removed
    pub async fn keys(&self) -> CacheResult<Vec<String>> {
        self.ensure_ready()?;
        if self.inner.queue.is_none() {
            return Ok(self.inner.mirror.keys());
        }

        self.inner
            .turn("keys", |inner: Arc<StoreInner>| async move { inner.disk.keys().await })
            .await
    }

    /// Delete expired entries owned by processes that are no longer alive
    pub async fn sweep(&self) -> CacheResult<usize> {
        self.ensure_ready()?;
        if self.inner.queue.is_none() {
            return Ok(0);
        }
        self.inner.sweep().await
    }

    /// Cancel pending evictions and release everything held in the work directory
    pub async fn shutdown(&self) {
        self.inner.stop.send_replace(true);
        self.inner.initialized.store(false, Ordering::Release);
        if let Some(queue) = &self.inner.queue {
            queue.shutdown().await;
        }
        debug!("Cache store {} shut down", self.inner.process_tag);
    }

    fn ensure_ready(&self) -> CacheResult<()> {
        if self.inner.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CacheError::NotInitialized)
        }
    }
}

impl StoreInner {
    /// Run `f` once this process holds the queue turn and return its result
    async fn turn<T, F, Fut>(self: &Arc<Self>, op: &'static str, f: F) -> CacheResult<T>
    where
        F: FnOnce(Arc<StoreInner>) -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let Some(queue) = &self.queue else {
            return Err(CacheError::Internal(format!(
                "{op} needs a queue but the store is memory-only"
            )));
        };

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(self);
        let job: Job = Box::new(move |turn: CacheResult<()>| {
            async move {
                let result = match turn {
                    Ok(()) => f(inner).await,
                    Err(e) => Err(e),
                };
                let _ = tx.send(result);
            }
            .boxed()
        });

        queue.enqueue(job)?;
        rx.await
            .map_err(|_| CacheError::Internal(format!("{op} job dropped without a result")))?
    }

    async fn sweep(self: &Arc<Self>) -> CacheResult<usize> {
        self.turn("sweep", |inner: Arc<StoreInner>| async move {
            let alive = inner.live_processes().await?;
            inner.disk.sweep(&alive).await
        })
        .await
    }

    async fn live_processes(&self) -> CacheResult<HashSet<String>> {
        match &self.queue {
            Some(queue) => queue.live_processes().await,
            None => Ok(HashSet::from([self.process_tag.clone()])),
        }
    }

    fn memory_get(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.mirror.get(key)?;
        if entry.is_expired(self.max_ttl) {
            self.mirror.invalidate(key);
            return None;
        }
        Some(entry)
    }

    /// Note a local write to `key`. Returns an id when the write needs an
    /// eviction; a write without TTL cancels any eviction still pending.
    fn record_write(&self, key: &str, ttl: Option<Duration>) -> Option<u64> {
        let mut writes = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        if ttl.is_some_and(|ttl| !ttl.is_zero()) {
            let write = self.next_write.fetch_add(1, Ordering::Relaxed);
            writes.insert(key.to_string(), write);
            Some(write)
        } else {
            writes.remove(key);
            None
        }
    }

    /// Consume the pending eviction of `key` if `write` is still the latest local write
    fn take_write(&self, key: &str, write: u64) -> bool {
        let mut writes = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        if writes.get(key) != Some(&write) {
            return false;
        }
        writes.remove(key);
        true
    }

    /// Drop the mirrored entry if `write` is still the latest write of `key`
    fn memory_expire(&self, key: &str, write: u64) -> bool {
        let _turn = self.memory_turn.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.take_write(key, write) {
            return false;
        }
        self.mirror.invalidate(key);
        true
    }

    /// Delete `entry` once its TTL elapses, unless it was overwritten first
    fn schedule_eviction(
        self: &Arc<Self>,
        key: &str,
        entry: &CacheEntry,
        ttl: Option<Duration>,
        write: Option<u64>,
    ) {
        let (Some(ttl), Some(write)) = (ttl, write) else {
            return;
        };
        let delay = ttl.min(self.max_ttl);

        let weak = Arc::downgrade(self);
        let mut stop = self.stop.subscribe();
        let key = key.to_string();
        let arrive_at = entry.arrive_at;

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.wait_for(|stopped| *stopped) => return,
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };

            // Local overwrites are caught by the write id, foreign ones by
            // the arrival stamp and owner on disk.
            let evicted = if inner.queue.is_some() {
                let target = key.clone();
                inner
                    .turn("evict", move |inner: Arc<StoreInner>| async move {
                        if !inner.take_write(&target, write) {
                            return Ok(false);
                        }
                        inner
                            .disk
                            .expire_if_unchanged(&target, arrive_at, &inner.mirror)
                            .await
                    })
                    .await
            } else {
                Ok(inner.memory_expire(&key, write))
            };

            match evicted {
                Ok(true) => debug!("Evicted [{}] after its TTL", key),
                Ok(false) => {}
                Err(e) => debug!("Skipped eviction of [{}]: {}", key, e),
            }
        });
    }
}
