//! file-mem-cache - cross-process TTL cache coordinated through the filesystem
//!
//! Sibling processes on one machine share a work directory. Each publishes a
//! heartbeat, takes turns through marker files in a shared queue directory,
//! and stores entries as JSON files with a TTL. Dead participants are
//! detected by stale heartbeats and their leftovers cleaned up by whoever
//! is still alive.

pub mod cli;
pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod layout;
pub mod liveness;
pub mod queue;
pub mod store;

pub use config::CacheOptions;
pub use error::{CacheError, CacheResult};
pub use liveness::HealthReport;
pub use queue::{FileOperationQueue, Job, JobQueue};
pub use serde_json::Value;
pub use store::{AppendOptions, CacheStore, MatchMode, RemoveKind, RemoveOptions};
