//! Queue directory change detection
//!
//! On Linux an inotify watch on the queue directory wakes the driver on every
//! marker creation or removal. Where the watch cannot be set up, or dies, the
//! driver falls back to listing the directory at a bounded interval and
//! comparing it with the last listing.

use crate::layout::list_names;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Watches a directory, natively when possible
pub struct DirWatcher {
    dir: PathBuf,
    last: Vec<String>,
    events: Option<mpsc::Receiver<()>>,
}

impl DirWatcher {
    pub fn new(dir: PathBuf) -> Self {
        let events = match spawn_watch_thread(&dir) {
            Ok(events) => Some(events),
            Err(reason) => {
                warn!("{}; polling {} instead", reason, dir.display());
                None
            }
        };
        Self {
            dir,
            last: Vec::new(),
            events,
        }
    }

    /// True while native notifications are flowing
    pub fn is_native(&self) -> bool {
        self.events.is_some()
    }

    /// Wait for the next native change event.
    ///
    /// Never resolves without a native watch. If the watch thread stops, this
    /// resolves once more and the watcher degrades to polling.
    pub async fn notified(&mut self) {
        let Some(events) = self.events.as_mut() else {
            return std::future::pending().await;
        };
        if events.recv().await.is_none() {
            warn!(
                "Queue watch on {} stopped; falling back to polling",
                self.dir.display()
            );
            self.events = None;
        }
    }

    /// Re-list the directory; true when the listing differs from the last one
    pub async fn changed(&mut self) -> bool {
        let mut names = match list_names(&self.dir).await {
            Ok(names) => names,
            Err(e) => {
                debug!("Queue directory poll failed: {}", e);
                return false;
            }
        };
        names.sort_unstable();
        if names == self.last {
            return false;
        }
        self.last = names;
        true
    }

    /// Record a listing taken elsewhere so it does not count as a change
    pub fn remember(&mut self, mut names: Vec<String>) {
        names.sort_unstable();
        self.last = names;
    }
}

/// Forward inotify events on `dir` into a channel that coalesces bursts.
///
/// The thread exits on the first event after the receiver is dropped, or when
/// the watch is lost (overflow, directory removed).
#[cfg(target_os = "linux")]
fn spawn_watch_thread(dir: &Path) -> Result<mpsc::Receiver<()>, String> {
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
    use tokio::sync::mpsc::error::TrySendError;

    let mask = AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO;

    let inotify = Inotify::init(InitFlags::IN_CLOEXEC)
        .map_err(|error| format!("inotify init failed: {error}"))?;
    inotify
        .add_watch(dir, mask)
        .map_err(|error| format!("inotify add watch failed: {error}"))?;

    let (tx, rx) = mpsc::channel(1);
    std::thread::Builder::new()
        .name("queue-watch".to_string())
        .spawn(move || loop {
            let events = match inotify.read_events() {
                Ok(events) => events,
                Err(error) => {
                    debug!("inotify read failed: {}", error);
                    return;
                }
            };
            let lost = events.iter().any(|event| {
                event
                    .mask
                    .intersects(AddWatchFlags::IN_Q_OVERFLOW | AddWatchFlags::IN_IGNORED)
            });
            match tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Closed(())) => return,
            }
            if lost {
                debug!("inotify watch lost (overflow or directory removed)");
                return;
            }
        })
        .map_err(|error| format!("queue watch thread failed to start: {error}"))?;

    Ok(rx)
}

#[cfg(not(target_os = "linux"))]
fn spawn_watch_thread(_dir: &Path) -> Result<mpsc::Receiver<()>, String> {
    Err("native queue watch unavailable on this platform".to_string())
}
