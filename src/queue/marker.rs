//! Queue marker files
//!
//! A marker is an empty claim on a turn, encoded entirely in its file name as
//! `<timestamp>.<seq>-<processTag>`. The per-process sequence number keeps
//! names unique when one process registers twice within a millisecond, and
//! the full `(timestamp, seq, tag)` ordering leaves no two markers equal.

use crate::error::{CacheError, CacheResult};
use crate::layout::list_names;
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// A parsed queue marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMarker {
    /// Registration time in epoch milliseconds
    pub timestamp: i64,
    /// Per-process registration counter
    pub seq: u64,
    /// Tag of the process that owns the marker
    pub owner: String,
}

impl QueueMarker {
    pub fn new(timestamp: i64, seq: u64, owner: impl Into<String>) -> Self {
        Self {
            timestamp,
            seq,
            owner: owner.into(),
        }
    }

    /// Parse a marker file name.
    ///
    /// Accepts `<timestamp>.<seq>-<tag>` and the older `<timestamp>-<tag>`.
    pub fn parse(name: &str) -> Option<Self> {
        let (stamp, owner) = name.split_once('-')?;
        if owner.is_empty() {
            return None;
        }
        let (timestamp, seq) = match stamp.split_once('.') {
            Some((ts, seq)) => (ts.parse().ok()?, seq.parse().ok()?),
            None => (stamp.parse().ok()?, 0),
        };
        Some(Self::new(timestamp, seq, owner))
    }

    pub fn file_name(&self) -> String {
        self.to_string()
    }

    pub fn path_in(&self, queue_dir: &Path) -> PathBuf {
        queue_dir.join(self.file_name())
    }

    /// Atomically create the marker file; fails if it already exists
    pub async fn create(&self, queue_dir: &Path) -> CacheResult<()> {
        let path = self.path_in(queue_dir);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| CacheError::io(format!("creating queue marker {}", path.display()), e))?;
        file.write_all(b"1")
            .await
            .map_err(|e| CacheError::io(format!("writing queue marker {}", path.display()), e))?;
        Ok(())
    }
}

impl fmt::Display for QueueMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}-{}", self.timestamp, self.seq, self.owner)
    }
}

impl Ord for QueueMarker {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.seq.cmp(&other.seq))
            .then_with(|| self.owner.cmp(&other.owner))
    }
}

impl PartialOrd for QueueMarker {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// All parseable markers in `queue_dir`; unparseable names are ignored
pub async fn list_markers(queue_dir: &Path) -> CacheResult<Vec<QueueMarker>> {
    let names = list_names(queue_dir).await?;
    Ok(names.iter().filter_map(|n| QueueMarker::parse(n)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parse_current_format() {
        let marker = QueueMarker::parse("1700000000000.7-1699999999999.4242").unwrap();
        assert_eq!(marker.timestamp, 1_700_000_000_000);
        assert_eq!(marker.seq, 7);
        assert_eq!(marker.owner, "1699999999999.4242");
    }

    #[test]
    fn parse_legacy_format_and_dashed_tags() {
        let marker = QueueMarker::parse("1700000000000-worker-a").unwrap();
        assert_eq!(marker.seq, 0);
        assert_eq!(marker.owner, "worker-a");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(QueueMarker::parse("").is_none());
        assert!(QueueMarker::parse("notanumber-tag").is_none());
        assert!(QueueMarker::parse("12.x-tag").is_none());
        assert!(QueueMarker::parse("12-").is_none());
        assert!(QueueMarker::parse("12").is_none());
    }

    #[test]
    fn file_name_round_trips() {
        let marker = QueueMarker::new(42, 3, "p-1");
        assert_eq!(QueueMarker::parse(&marker.file_name()), Some(marker));
    }

    #[test]
    fn ordering_breaks_timestamp_ties() {
        let a = QueueMarker::new(100, 2, "b");
        let b = QueueMarker::new(100, 1, "z");
        let c = QueueMarker::new(100, 1, "a");
        let d = QueueMarker::new(99, 9, "z");

        let markers = [a.clone(), b.clone(), c.clone(), d.clone()];
        assert_eq!(markers.iter().min(), Some(&d));

        let mut sorted = markers.to_vec();
        sorted.sort();
        assert_eq!(sorted, vec![d, c, b, a]);
    }

    #[tokio::test]
    async fn create_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let marker = QueueMarker::new(1, 0, "p");

        marker.create(temp.path()).await.unwrap();
        assert!(marker.create(temp.path()).await.is_err());

        let listed = list_markers(temp.path()).await.unwrap();
        assert_eq!(listed, vec![marker]);
    }
}
