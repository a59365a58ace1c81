//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;

/// file-mem-cache - cross-process TTL cache in a shared directory
///
/// Runs one cache operation as its own process and prints the result as
/// JSON, so several invocations can exercise the queue concurrently.
#[derive(Parser, Debug)]
#[command(name = "file-mem-cache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "FILE_MEM_CACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Shared work directory (overrides the config file)
    #[arg(short, long, global = true, env = "FILE_MEM_CACHE_WORKDIR")]
    pub workdir: Option<PathBuf>,

    /// Heartbeat timeout in milliseconds
    #[arg(long, global = true)]
    pub heartbeat_ms: Option<u64>,

    /// Wait after startup for siblings to publish heartbeats, in milliseconds
    #[arg(long, global = true)]
    pub grace_ms: Option<u64>,

    /// Process tag (defaults to <startMillis>.<pid>)
    #[arg(long, global = true)]
    pub tag: Option<String>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the value stored under a key (null if absent or expired)
    Get {
        /// Cache key
        key: String,
    },

    /// Store a value
    Set {
        /// Cache key
        key: String,

        /// Value as JSON; anything that is not valid JSON is stored as a string
        #[arg(value_parser = parse_json)]
        value: Value,

        /// Time to live in milliseconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Delete a key
    Reset {
        /// Cache key
        key: String,
    },

    /// Append to a sequence or merge into a mapping
    Append {
        /// Cache key
        key: String,

        /// Element or mapping to add, as JSON
        #[arg(value_parser = parse_json)]
        value: Value,

        /// Starting value when the key is absent
        #[arg(long, value_parser = parse_json)]
        initial: Option<Value>,

        /// Time to live of the merged value in milliseconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Remove an element, a range, or a mapping field
    Remove {
        /// Cache key
        key: String,

        /// Element to remove, or 1-based start position with --index (negative counts from the end)
        #[arg(value_parser = parse_json, allow_hyphen_values = true)]
        item: Value,

        /// Treat the item as a position
        #[arg(long)]
        index: bool,

        /// Number of elements to remove with --index
        #[arg(long, default_value = "1", requires = "index")]
        length: usize,

        /// Remove every equal element instead of the first
        #[arg(long, conflicts_with = "index")]
        all: bool,
    },

    /// List stored keys
    Keys {
        /// Output format
        #[arg(short, long, default_value = "json")]
        format: OutputFormat,
    },

    /// Run a health check and print what it removed
    Health,
}

/// Output format for the keys command
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// JSON array
    Json,
    /// One key per line
    Plain,
}

/// Parse a JSON argument, falling back to a plain string
fn parse_json(s: &str) -> Result<Value, String> {
    Ok(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string())))
}
