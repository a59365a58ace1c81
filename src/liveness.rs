//! Heartbeat-based liveness tracking
//!
//! Every participant refreshes `<workdir>/proc/<tag>` with the current time.
//! A heartbeat younger than the timeout means "alive". Health checks delete
//! stale heartbeats, and then purge whatever the dead processes left behind:
//! queue markers, staging directories and expired entries.
//!
//! Health checks run as a side effect of the heartbeat timer, so they never
//! return errors; failures are logged and the pass carries on.

use crate::clock::{age_millis, duration_millis, now_millis};
use crate::config::CacheOptions;
use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::layout::{list_names, remove_if_exists, write_atomic, WorkLayout};
use crate::queue::marker::list_markers;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Classification of the heartbeats found on disk
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    pub alive: HashSet<String>,
    pub dead: HashSet<String>,
}

/// What a health check pass cleaned up
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    /// Tags with a fresh heartbeat
    pub alive: HashSet<String>,
    pub removed_heartbeats: usize,
    pub removed_markers: usize,
    pub removed_entries: usize,
    pub removed_staging: usize,
}

impl HealthReport {
    pub fn removed_anything(&self) -> bool {
        self.removed_heartbeats + self.removed_markers + self.removed_entries + self.removed_staging
            > 0
    }
}

/// Publishes this process's heartbeat and reaps dead siblings
pub struct LivenessTracker {
    layout: WorkLayout,
    process_tag: String,
    heartbeat_timeout: Duration,
    heartbeat_interval: Duration,
    max_ttl: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
    swept: Arc<Notify>,
}

impl LivenessTracker {
    pub fn new(layout: WorkLayout, process_tag: String, options: &CacheOptions) -> Self {
        Self {
            layout,
            process_tag,
            heartbeat_timeout: options.heartbeat_timeout(),
            heartbeat_interval: options.heartbeat_interval(),
            max_ttl: options.max_ttl(),
            timer: Mutex::new(None),
            swept: Arc::new(Notify::new()),
        }
    }

    pub fn process_tag(&self) -> &str {
        &self.process_tag
    }

    /// Signalled after every timer-driven health check
    pub fn swept(&self) -> Arc<Notify> {
        Arc::clone(&self.swept)
    }

    /// Start the periodic heartbeat.
    ///
    /// Only one timer ever runs per tracker; later calls return `false`.
    pub fn heartbeat(self: &Arc<Self>) -> bool {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.heartbeat_interval;
        *timer = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tracker) = weak.upgrade() else {
                    break;
                };
                tracker.beat().await;
            }
        }));

        debug!(
            "Started heartbeat for {} every {:?}",
            self.process_tag, period
        );
        true
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// One timer tick: refresh, check, wake the queue
    async fn beat(&self) {
        if let Err(e) = self.refresh().await {
            warn!("Failed to refresh heartbeat for {}: {}", self.process_tag, e);
        }
        let report = self.health_check().await;
        if report.removed_anything() {
            debug!("Health check report: {:?}", report);
        }
        self.swept.notify_one();
    }

    /// Write the current time to this process's heartbeat marker
    pub async fn refresh(&self) -> CacheResult<()> {
        write_atomic(
            &self.layout.staging_for(&self.process_tag),
            &self.layout.heartbeat_path(&self.process_tag),
            now_millis().to_string().as_bytes(),
        )
        .await
    }

    /// Read every heartbeat and classify its owner.
    ///
    /// This process always counts as alive.
    pub async fn scan(&self) -> CacheResult<Liveness> {
        let timeout = duration_millis(self.heartbeat_timeout);
        let mut liveness = Liveness::default();

        for tag in list_names(&self.layout.proc_dir).await? {
            if tag == self.process_tag {
                continue;
            }
            let path = self.layout.heartbeat_path(&tag);
            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                // Removed by another checker since the listing
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(CacheError::io(
                        format!("reading heartbeat {}", path.display()),
                        e,
                    ))
                }
            };

            match content.trim().parse::<i64>() {
                Ok(stamp) if age_millis(stamp) < timeout => {
                    liveness.alive.insert(tag);
                }
                _ => {
                    liveness.dead.insert(tag);
                }
            }
        }

        liveness.alive.insert(self.process_tag.clone());
        Ok(liveness)
    }

    /// Reap artifacts of dead processes. Never fails.
    pub async fn health_check(&self) -> HealthReport {
        let mut report = HealthReport::default();
        let liveness = match self.scan().await {
            Ok(liveness) => liveness,
            Err(e) => {
                warn!("Error when checking health: {}", e);
                return report;
            }
        };

        for tag in &liveness.dead {
            match remove_if_exists(&self.layout.heartbeat_path(tag)).await {
                Ok(true) => {
                    info!("Removed stale heartbeat of {}", tag);
                    report.removed_heartbeats += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to remove heartbeat of {}: {}", tag, e),
            }
        }

        report.removed_markers = self.purge_markers(&liveness).await;
        report.removed_staging = self.purge_staging(&liveness).await;
        report.removed_entries = self.purge_entries(&liveness.alive).await;
        report.alive = liveness.alive;
        report
    }

    // A marker whose owner has no heartbeat at all may belong to a sibling
    // that has not published its first one yet, so it must also be old.
    async fn purge_markers(&self, liveness: &Liveness) -> usize {
        let timeout = duration_millis(self.heartbeat_timeout);
        let markers = match list_markers(&self.layout.queue_dir).await {
            Ok(markers) => markers,
            Err(e) => {
                warn!("Error when listing queue markers: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for marker in markers {
            if liveness.alive.contains(&marker.owner) {
                continue;
            }
            let orphaned =
                liveness.dead.contains(&marker.owner) || age_millis(marker.timestamp) >= timeout;
            if !orphaned {
                continue;
            }
            match remove_if_exists(&marker.path_in(&self.layout.queue_dir)).await {
                Ok(true) => {
                    info!("Removed orphan queue marker {}", marker);
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to remove queue marker {}: {}", marker, e),
            }
        }
        removed
    }

    async fn purge_staging(&self, liveness: &Liveness) -> usize {
        let owners = match list_names(&self.layout.staging_dir).await {
            Ok(owners) => owners,
            Err(e) => {
                debug!("Error when listing staging directory: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for owner in owners.iter().filter(|o| liveness.dead.contains(*o)) {
            let dir = self.layout.staging_for(owner);
            match fs::remove_dir_all(&dir).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove staging dir {}: {}", dir.display(), e),
            }
        }
        removed
    }

    // Entries of live owners are left alone even when stale; readers expire
    // those lazily.
    async fn purge_entries(&self, alive: &HashSet<String>) -> usize {
        let names = match list_names(&self.layout.data_dir).await {
            Ok(names) => names,
            Err(e) => {
                warn!("Error when listing cache entries: {}", e);
                return 0;
            }
        };

        let now = now_millis();
        let mut removed = 0;
        for name in names {
            let path = self.layout.data_dir.join(&name);
            let entry = match CacheEntry::load(&path).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping unreadable entry {}: {}", name, e);
                    continue;
                }
            };
            if alive.contains(&entry.process_tag) || !entry.is_expired_at(now, self.max_ttl) {
                continue;
            }
            match remove_if_exists(&path).await {
                Ok(true) => {
                    debug!("Removed expired entry {} of dead process {}", name, entry.process_tag);
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to remove entry {}: {}", name, e),
            }
        }
        removed
    }

    /// Stop the timer and withdraw this process's heartbeat, best effort
    pub async fn stop(&self) {
        let handle = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        if let Err(e) = remove_if_exists(&self.layout.heartbeat_path(&self.process_tag)).await {
            debug!("Failed to remove own heartbeat: {}", e);
        }
        match fs::remove_dir_all(self.layout.staging_for(&self.process_tag)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("Failed to remove own staging dir: {}", e),
        }
        debug!("Stopped heartbeat for {}", self.process_tag);
    }
}

impl Drop for LivenessTracker {
    fn drop(&mut self) {
        let timer = self.timer.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = timer.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::marker::QueueMarker;
    use serde_json::json;
    use tempfile::TempDir;

    async fn tracker(temp: &TempDir, tag: &str, timeout_ms: u64) -> Arc<LivenessTracker> {
        let layout = WorkLayout::new(temp.path());
        layout.ensure().await.unwrap();
        let mut options = CacheOptions::with_workdir(temp.path());
        options.heartbeat_timeout_ms = timeout_ms;
        options.max_ttl_ms = 60_000;
        Arc::new(LivenessTracker::new(layout, tag.to_string(), &options))
    }

    async fn write_heartbeat(temp: &TempDir, tag: &str, stamp: i64) {
        fs::write(temp.path().join("proc").join(tag), stamp.to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refresh_writes_timestamp() {
        let temp = TempDir::new().unwrap();
        let tracker = tracker(&temp, "me", 1000).await;

        tracker.refresh().await.unwrap();
        let content = fs::read_to_string(temp.path().join("proc/me")).await.unwrap();
        assert!(age_millis(content.parse().unwrap()) < 1000);
    }

    #[tokio::test]
    async fn heartbeat_starts_once() {
        let temp = TempDir::new().unwrap();
        let tracker = tracker(&temp, "me", 300).await;

        assert!(tracker.heartbeat());
        assert!(!tracker.heartbeat());
        assert!(tracker.is_running());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(temp.path().join("proc/me").exists());

        tracker.stop().await;
        assert!(!tracker.is_running());
        assert!(!temp.path().join("proc/me").exists());
    }

    #[tokio::test]
    async fn scan_classifies_by_age() {
        let temp = TempDir::new().unwrap();
        let tracker = tracker(&temp, "me", 1000).await;
        write_heartbeat(&temp, "fresh", now_millis()).await;
        write_heartbeat(&temp, "stale", now_millis() - 5000).await;
        write_heartbeat(&temp, "garbage", 0).await;
        fs::write(temp.path().join("proc/unparseable"), "NaN").await.unwrap();

        let liveness = tracker.scan().await.unwrap();
        assert!(liveness.alive.contains("fresh"));
        assert!(liveness.alive.contains("me"));
        assert!(liveness.dead.contains("stale"));
        assert!(liveness.dead.contains("garbage"));
        assert!(liveness.dead.contains("unparseable"));
    }

    #[tokio::test]
    async fn health_check_purges_dead_process_artifacts() {
        let temp = TempDir::new().unwrap();
        let tracker = tracker(&temp, "me", 1000).await;
        let queue_dir = temp.path().join("queue");
        let data_dir = temp.path().join("data");

        write_heartbeat(&temp, "dead", now_millis() - 5000).await;
        write_heartbeat(&temp, "live", now_millis()).await;

        let dead_marker = QueueMarker::new(now_millis(), 0, "dead");
        let live_marker = QueueMarker::new(now_millis() - 5000, 0, "live");
        dead_marker.create(&queue_dir).await.unwrap();
        live_marker.create(&queue_dir).await.unwrap();
        fs::create_dir_all(temp.path().join("staging/dead")).await.unwrap();

        let mut dead_expired = CacheEntry::new(json!(1), Some(Duration::from_millis(10)), "dead");
        dead_expired.arrive_at -= 1000;
        let dead_fresh = CacheEntry::new(json!(2), None, "dead");
        let mut live_expired = CacheEntry::new(json!(3), Some(Duration::from_millis(10)), "live");
        live_expired.arrive_at -= 1000;
        let staging = temp.path().join("staging/test");
        dead_expired.save(&staging, &data_dir.join("a")).await.unwrap();
        dead_fresh.save(&staging, &data_dir.join("b")).await.unwrap();
        live_expired.save(&staging, &data_dir.join("c")).await.unwrap();

        let report = tracker.health_check().await;

        assert_eq!(report.removed_heartbeats, 1);
        assert_eq!(report.removed_markers, 1);
        assert_eq!(report.removed_entries, 1);
        assert_eq!(report.removed_staging, 1);
        assert!(report.alive.contains("live"));

        assert!(!temp.path().join("proc/dead").exists());
        assert!(!dead_marker.path_in(&queue_dir).exists());
        assert!(live_marker.path_in(&queue_dir).exists());
        assert!(!data_dir.join("a").exists());
        assert!(data_dir.join("b").exists());
        assert!(data_dir.join("c").exists());
    }

    #[tokio::test]
    async fn fresh_marker_without_heartbeat_is_kept() {
        let temp = TempDir::new().unwrap();
        let tracker = tracker(&temp, "me", 1000).await;
        let queue_dir = temp.path().join("queue");

        let newcomer = QueueMarker::new(now_millis(), 0, "starting");
        let abandoned = QueueMarker::new(now_millis() - 2000, 0, "vanished");
        newcomer.create(&queue_dir).await.unwrap();
        abandoned.create(&queue_dir).await.unwrap();

        let report = tracker.health_check().await;
        assert_eq!(report.removed_markers, 1);
        assert!(newcomer.path_in(&queue_dir).exists());
        assert!(!abandoned.path_in(&queue_dir).exists());
    }

    #[tokio::test]
    async fn health_check_tolerates_corrupt_entries() {
        let temp = TempDir::new().unwrap();
        let tracker = tracker(&temp, "me", 1000).await;
        fs::write(temp.path().join("data/broken"), "{").await.unwrap();

        let report = tracker.health_check().await;
        assert_eq!(report.removed_entries, 0);
        assert!(temp.path().join("data/broken").exists());
    }

    #[tokio::test]
    async fn health_check_survives_missing_directories() {
        let temp = TempDir::new().unwrap();
        let mut options = CacheOptions::with_workdir(temp.path().join("nowhere"));
        options.heartbeat_timeout_ms = 1000;
        let tracker = LivenessTracker::new(
            WorkLayout::new(temp.path().join("nowhere")),
            "me".to_string(),
            &options,
        );

        let report = tracker.health_check().await;
        assert!(!report.removed_anything());
    }
}
