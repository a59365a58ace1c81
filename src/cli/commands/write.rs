//! Write commands - set, reset, append and remove

use crate::cli::commands::print_json;
use crate::error::CacheResult;
use crate::store::{AppendOptions, CacheStore, RemoveOptions};
use serde_json::{json, Value};
use std::time::Duration;

pub async fn set(store: &CacheStore, key: &str, value: Value, ttl: Option<u64>) -> CacheResult<()> {
    store
        .set(key, value, ttl.map(Duration::from_millis))
        .await?;
    print_json(&json!({ "ok": true }))
}

pub async fn reset(store: &CacheStore, key: &str) -> CacheResult<()> {
    store.reset(key).await?;
    print_json(&json!({ "ok": true }))
}

/// Print the merged value
pub async fn append(
    store: &CacheStore,
    key: &str,
    value: Value,
    initial: Option<Value>,
    ttl: Option<u64>,
) -> CacheResult<()> {
    let mut options = initial.map(AppendOptions::initial).unwrap_or_default();
    if let Some(ttl) = ttl {
        options = options.with_ttl(Duration::from_millis(ttl));
    }
    let merged = store.append(key, value, options).await?;
    print_json(&merged)
}

/// Print the new value, `null` when the key did not exist
pub async fn remove(
    store: &CacheStore,
    key: &str,
    item: Value,
    index: bool,
    length: usize,
    all: bool,
) -> CacheResult<()> {
    let options = if index {
        RemoveOptions::index(length)
    } else if all {
        RemoveOptions::all()
    } else {
        RemoveOptions::default()
    };
    let updated = store.remove(key, item, options).await?;
    print_json(&updated)
}
