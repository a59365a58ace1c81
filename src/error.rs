//! Error types for file-mem-cache
//!
//! All modules use `CacheResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// All errors that can occur in the cache
#[derive(Error, Debug)]
pub enum CacheError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Invalid process tag {0:?}: must be a non-empty single path segment")]
    InvalidTag(String),

    // Key and payload errors
    #[error("Invalid cache key {0:?}")]
    InvalidKey(String),

    #[error("Cannot {operation}: expected {expected}, found {found}")]
    ShapeMismatch {
        operation: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Corrupt cache entry at {path}: {source}")]
    CorruptEntry {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    // Queue errors
    #[error("Cache used before init() completed")]
    NotInitialized,

    #[error("Operation queue is closed")]
    QueueClosed,

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a shape mismatch error
    pub fn shape(operation: &'static str, expected: &'static str, found: &'static str) -> Self {
        Self::ShapeMismatch {
            operation,
            expected,
            found,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Await CacheStore::init() before issuing operations"),
            Self::QueueClosed => Some("The cache was shut down; create a new CacheStore"),
            Self::InvalidTag(_) => Some("Process tags may not contain '/' or be '.' or '..'"),
            Self::ShapeMismatch { .. } => {
                Some("append/remove need a sequence or mapping value of a matching shape")
            }
            _ => None,
        }
    }
}
