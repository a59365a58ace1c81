//! On-disk cache entry and TTL policy

use crate::clock::{duration_millis, now_millis};
use crate::error::{CacheError, CacheResult};
use crate::layout::write_atomic;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// One persisted key, stored as `{arriveAt, data, ttl?, processTag}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// When the value was written, in epoch milliseconds
    pub arrive_at: i64,

    /// The cached payload
    pub data: Value,

    /// Requested TTL in milliseconds, as given by the writer
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_ttl"
    )]
    pub ttl: Option<i64>,

    /// Tag of the process that wrote the entry
    #[serde(default)]
    pub process_tag: String,
}

impl CacheEntry {
    /// Entry arriving now
    pub fn new(data: Value, ttl: Option<Duration>, process_tag: &str) -> Self {
        Self {
            arrive_at: now_millis(),
            data,
            ttl: ttl.map(duration_millis),
            process_tag: process_tag.to_string(),
        }
    }

    pub fn effective_ttl(&self, max_ttl: Duration) -> i64 {
        effective_ttl_millis(self.ttl, max_ttl)
    }

    pub fn is_expired_at(&self, now: i64, max_ttl: Duration) -> bool {
        now.saturating_sub(self.arrive_at) > self.effective_ttl(max_ttl)
    }

    pub fn is_expired(&self, max_ttl: Duration) -> bool {
        self.is_expired_at(now_millis(), max_ttl)
    }

    /// Read an entry, `None` if the file does not exist
    pub async fn load(path: &Path) -> CacheResult<Option<Self>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CacheError::io(
                    format!("reading cache entry {}", path.display()),
                    e,
                ))
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| CacheError::CorruptEntry {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Atomically write the entry to `path`
    pub async fn save(&self, staging: &Path, path: &Path) -> CacheResult<()> {
        let content = serde_json::to_vec(self)?;
        write_atomic(staging, path, &content).await
    }
}

/// `min(requested, max)`, or `max` when nothing positive was requested
pub fn effective_ttl_millis(ttl: Option<i64>, max_ttl: Duration) -> i64 {
    let max = duration_millis(max_ttl);
    match ttl {
        Some(requested) if requested > 0 => requested.min(max),
        _ => max,
    }
}

// Older writers stored whatever TTL the caller passed, including floats and
// numeric strings. Anything unusable collapses to `None`, i.e. the maximum.
fn lenient_ttl<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    }))
}
