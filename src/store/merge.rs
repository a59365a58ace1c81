//! Shape-aware append and removal on JSON payloads

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Options for `CacheStore::append`
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Starting value when the key is absent; an empty sequence if unset
    pub initial_value: Option<Value>,

    /// TTL of the merged entry, with `set` semantics
    pub ttl: Option<Duration>,
}

impl AppendOptions {
    pub fn initial(value: Value) -> Self {
        Self {
            initial_value: Some(value),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// How `remove` interprets its item argument on sequences
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoveKind {
    /// The item is a position; `length` elements are cut from there
    Index,
    /// The item is a value compared for equality
    #[default]
    Item,
}

/// Which equal elements `RemoveKind::Item` removes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    First,
    All,
}

/// Options for `CacheStore::remove`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOptions {
    pub kind: RemoveKind,
    pub matching: MatchMode,
    pub length: usize,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            kind: RemoveKind::Item,
            matching: MatchMode::First,
            length: 1,
        }
    }
}

impl RemoveOptions {
    /// Cut `length` elements starting at the item's position
    pub fn index(length: usize) -> Self {
        Self {
            kind: RemoveKind::Index,
            length,
            ..Self::default()
        }
    }

    /// Remove every element equal to the item
    pub fn all() -> Self {
        Self {
            matching: MatchMode::All,
            ..Self::default()
        }
    }
}

/// Name of a value's shape, for error messages
pub fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// Push `item` onto a sequence, or shallow-merge a mapping into a mapping
pub fn append_value(base: Value, item: Value) -> CacheResult<Value> {
    match base {
        Value::Array(mut items) => {
            items.push(item);
            Ok(Value::Array(items))
        }
        Value::Object(mut fields) => match item {
            Value::Object(extra) => {
                fields.extend(extra);
                Ok(Value::Object(fields))
            }
            other => Err(CacheError::shape("append", "mapping", shape_name(&other))),
        },
        other => Err(CacheError::shape(
            "append",
            "sequence or mapping",
            shape_name(&other),
        )),
    }
}

/// Remove `item` from a sequence or mapping according to `options`
pub fn remove_value(base: Value, item: &Value, options: &RemoveOptions) -> CacheResult<Value> {
    match base {
        Value::Array(mut items) => {
            match options.kind {
                RemoveKind::Index => {
                    let start = splice_start(item, items.len())?;
                    let end = start.saturating_add(options.length).min(items.len());
                    items.drain(start..end);
                }
                RemoveKind::Item => match options.matching {
                    MatchMode::First => {
                        if let Some(pos) = items.iter().position(|v| v == item) {
                            items.remove(pos);
                        }
                    }
                    MatchMode::All => items.retain(|v| v != item),
                },
            }
            Ok(Value::Array(items))
        }
        Value::Object(mut fields) => {
            let field = match item {
                Value::String(name) => name.clone(),
                Value::Number(n) => n.to_string(),
                other => return Err(CacheError::shape("remove", "field name", shape_name(other))),
            };
            fields.remove(&field);
            Ok(Value::Object(fields))
        }
        other => Err(CacheError::shape(
            "remove",
            "sequence or mapping",
            shape_name(&other),
        )),
    }
}

// Positions start at 1; negative positions count back from the last element.
// Positions past either end leave nothing to remove.
fn splice_start(item: &Value, len: usize) -> CacheResult<usize> {
    let position = item.as_i64().ok_or_else(|| {
        CacheError::InvalidArgument(format!("index must be an integer, got {}", item))
    })?;
    if position == 0 {
        return Err(CacheError::InvalidArgument(
            "index positions start at 1".to_string(),
        ));
    }
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let start = if position < 0 {
        (len + position).max(0)
    } else {
        (position - 1).min(len)
    };
    Ok(usize::try_from(start).unwrap_or(0))
}
