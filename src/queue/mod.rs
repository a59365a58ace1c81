//! Cross-process operation queue
//!
//! Serialises jobs across every process sharing a work directory so that at
//! most one of them touches the cache data at any moment.
//!
//! # Protocol
//!
//! | Step | Action |
//! |------|--------|
//! | register | create `queue/<timestamp>.<seq>-<tag>` for each local job |
//! | arbitrate | list markers, the minimum one is the head |
//! | run | the head's owner pops and runs one local job |
//! | release | the owner deletes its head marker, waking the others |
//!
//! Waiting processes notice the release through a native watch on the queue
//! directory (inotify on Linux). Without one they poll the directory at a
//! bounded interval. The heartbeat timer also nudges them after every health
//! check.

mod file_queue;
pub mod marker;
mod watch;

pub use file_queue::FileOperationQueue;
pub use marker::QueueMarker;
pub use watch::DirWatcher;

use crate::error::CacheResult;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashSet;

/// A unit of work waiting for this process's turn.
///
/// Called exactly once: with `Ok(())` when the job holds the turn, or with the
/// error that prevents it from ever running.
pub type Job = Box<dyn FnOnce(CacheResult<()>) -> BoxFuture<'static, ()> + Send>;

/// Mutual exclusion over the shared cache data
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Prepare the queue; must complete before jobs can run
    async fn init(&self) -> CacheResult<()>;

    /// Tag identifying this process to its siblings
    fn process_tag(&self) -> &str;

    /// Hand a job to the queue without waiting for it to run
    fn enqueue(&self, job: Job) -> CacheResult<()>;

    /// Tags of processes currently considered alive
    async fn live_processes(&self) -> CacheResult<HashSet<String>> {
        Ok(HashSet::from([self.process_tag().to_string()]))
    }

    /// Stop accepting jobs and release everything this process holds
    async fn shutdown(&self);
}
