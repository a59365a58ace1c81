//! Filesystem implementation of the operation queue
//!
//! A single driver task per process owns the local FIFO. It registers one
//! marker per accepted job, and whenever the queue directory changes (a
//! native watch event, or a poll when no watch is available) it re-reads the
//! markers: if the minimum belongs to this process it runs the
//! oldest local job and removes that marker.

use crate::clock::now_millis;
use crate::config::{validate_tag, CacheOptions};
use crate::error::{CacheError, CacheResult};
use crate::layout::{list_names, remove_if_exists, WorkLayout};
use crate::liveness::{HealthReport, LivenessTracker};
use crate::queue::marker::QueueMarker;
use crate::queue::watch::DirWatcher;
use crate::queue::{Job, JobQueue};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

enum QueueCommand {
    Enqueue(Job),
    Shutdown(oneshot::Sender<()>),
}

/// Operation queue coordinated through `<workdir>/queue`
pub struct FileOperationQueue {
    layout: WorkLayout,
    process_tag: String,
    poll_interval: Duration,
    startup_grace: Duration,
    liveness: Arc<LivenessTracker>,
    started: AtomicBool,
    tx: mpsc::UnboundedSender<QueueCommand>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<QueueCommand>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl FileOperationQueue {
    /// Create a queue; nothing touches the disk until `init`
    pub fn new(options: &CacheOptions) -> CacheResult<Self> {
        let process_tag = options.resolved_tag();
        validate_tag(&process_tag)?;

        let layout = WorkLayout::new(&options.workdir);
        let liveness = Arc::new(LivenessTracker::new(
            layout.clone(),
            process_tag.clone(),
            options,
        ));
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            layout,
            process_tag,
            poll_interval: options.queue_poll_interval(),
            startup_grace: options.startup_grace(),
            liveness,
            started: AtomicBool::new(false),
            tx,
            rx: Mutex::new(Some(rx)),
            driver: Mutex::new(None),
        })
    }

    pub fn liveness(&self) -> &Arc<LivenessTracker> {
        &self.liveness
    }

    /// Run a health check outside the heartbeat timer
    pub async fn health_check(&self) -> HealthReport {
        self.liveness.health_check().await
    }
}

#[async_trait]
impl JobQueue for FileOperationQueue {
    async fn init(&self) -> CacheResult<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        self.layout.ensure().await?;
        self.liveness.refresh().await?;

        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(rx) = rx else {
            return Ok(());
        };

        self.liveness.heartbeat();
        let report = self.liveness.health_check().await;
        debug!("Initial health check: {} process(es) alive", report.alive.len());

        let driver = QueueDriver {
            queue_dir: self.layout.queue_dir.clone(),
            tag: self.process_tag.clone(),
            seq: 0,
            pending: VecDeque::new(),
            watcher: DirWatcher::new(self.layout.queue_dir.clone()),
        };
        let handle = tokio::spawn(driver.run(rx, self.poll_interval, self.liveness.swept()));
        *self.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self.started.store(true, Ordering::Release);

        // Siblings launched alongside us need time to publish a heartbeat
        // before anyone's health check could mistake them for orphans.
        if !self.startup_grace.is_zero() {
            tokio::time::sleep(self.startup_grace).await;
        }

        info!(
            "Operation queue ready for {} in {}",
            self.process_tag,
            self.layout.root.display()
        );
        Ok(())
    }

    fn process_tag(&self) -> &str {
        &self.process_tag
    }

    fn enqueue(&self, job: Job) -> CacheResult<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(CacheError::NotInitialized);
        }
        self.tx
            .send(QueueCommand::Enqueue(job))
            .map_err(|_| CacheError::QueueClosed)
    }

    async fn live_processes(&self) -> CacheResult<HashSet<String>> {
        Ok(self.liveness.scan().await?.alive)
    }

    async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(QueueCommand::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }

        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.liveness.stop().await;
        info!("Operation queue for {} shut down", self.process_tag);
    }
}

impl Drop for FileOperationQueue {
    fn drop(&mut self) {
        let driver = self.driver.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = driver.take() {
            handle.abort();
        }
    }
}

/// Owns the local FIFO and drives arbitration
struct QueueDriver {
    queue_dir: PathBuf,
    tag: String,
    seq: u64,
    pending: VecDeque<Job>,
    watcher: DirWatcher,
}

impl QueueDriver {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<QueueCommand>,
        poll_interval: Duration,
        swept: Arc<Notify>,
    ) {
        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(QueueCommand::Enqueue(job)) => self.accept(job).await,
                    Some(QueueCommand::Shutdown(done)) => {
                        self.close(&mut rx).await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.close(&mut rx).await;
                        return;
                    }
                },
                () = self.watcher.notified(), if !self.pending.is_empty() => self.advance().await,
                _ = poll.tick(), if !self.pending.is_empty() && !self.watcher.is_native() => {
                    if self.watcher.changed().await {
                        self.advance().await;
                    }
                }
                _ = swept.notified(), if !self.pending.is_empty() => self.advance().await,
            }
        }
    }

    /// Register a marker for the job, then try to take a turn
    async fn accept(&mut self, job: Job) {
        match self.register().await {
            Ok(()) => {
                self.pending.push_back(job);
                self.advance().await;
            }
            Err(e) => {
                warn!("Failed to register queue marker: {}", e);
                job(Err(e)).await;
            }
        }
    }

    async fn register(&mut self) -> CacheResult<()> {
        let marker = QueueMarker::new(now_millis(), self.seq, self.tag.as_str());
        self.seq += 1;
        marker.create(&self.queue_dir).await?;
        debug!("Registered queue marker {}", marker);
        Ok(())
    }

    /// Run local jobs for as long as this process holds the head marker
    async fn advance(&mut self) {
        loop {
            let names = match list_names(&self.queue_dir).await {
                Ok(names) => names,
                Err(e) => {
                    warn!("Error when reading queue directory: {}", e);
                    return;
                }
            };
            let markers: Vec<QueueMarker> =
                names.iter().filter_map(|n| QueueMarker::parse(n)).collect();
            self.watcher.remember(names);

            let own: Vec<&QueueMarker> = markers.iter().filter(|m| m.owner == self.tag).collect();
            if self.pending.is_empty() {
                for marker in own {
                    release_marker(marker.path_in(&self.queue_dir)).await;
                }
                return;
            }

            // A sibling's health check purged our markers while we looked dead
            if own.len() < self.pending.len() {
                let missing = self.pending.len() - own.len();
                warn!("Re-registering {} purged queue marker(s)", missing);
                for _ in 0..missing {
                    if let Err(e) = self.register().await {
                        warn!("Failed to re-register queue marker: {}", e);
                        return;
                    }
                }
                continue;
            }

            let Some(head) = markers.iter().min() else {
                return;
            };
            if head.owner != self.tag {
                return;
            }

            if let Some(job) = self.pending.pop_front() {
                if AssertUnwindSafe(job(Ok(()))).catch_unwind().await.is_err() {
                    error!("Queued job panicked while holding {}", head);
                }
            }
            if !release_marker(head.path_in(&self.queue_dir)).await {
                return;
            }
        }
    }

    /// Fail everything still waiting and withdraw our markers
    async fn close(&mut self, rx: &mut mpsc::UnboundedReceiver<QueueCommand>) {
        rx.close();
        while let Ok(command) = rx.try_recv() {
            match command {
                QueueCommand::Enqueue(job) => self.pending.push_back(job),
                QueueCommand::Shutdown(done) => {
                    let _ = done.send(());
                }
            }
        }

        let abandoned = self.pending.len();
        for job in self.pending.drain(..) {
            job(Err(CacheError::QueueClosed)).await;
        }
        if abandoned > 0 {
            debug!("Failed {} pending job(s) at shutdown", abandoned);
        }

        match list_names(&self.queue_dir).await {
            Ok(names) => {
                for marker in names.iter().filter_map(|n| QueueMarker::parse(n)) {
                    if marker.owner == self.tag {
                        release_marker(marker.path_in(&self.queue_dir)).await;
                    }
                }
            }
            Err(e) => warn!("Error when reading queue directory at shutdown: {}", e),
        }
    }
}

/// Delete a marker file; false when it could not be removed
async fn release_marker(path: PathBuf) -> bool {
    match remove_if_exists(&path).await {
        Ok(_) => true,
        Err(e) => {
            warn!("Error when removing queue marker {}: {}", path.display(), e);
            false
        }
    }
}
