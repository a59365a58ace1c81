//! CLI command implementations
//!
//! Each invocation opens the store, runs one operation, prints the result
//! as JSON and shuts the store down again, even when the operation failed.

pub mod health;
pub mod read;
pub mod write;

pub use health::execute as health;

use crate::cli::args::Commands;
use crate::config::CacheOptions;
use crate::error::CacheResult;
use crate::store::CacheStore;
use serde::Serialize;
use tracing::debug;

/// Run a store command against the configured work directory
pub async fn execute(command: Commands, options: CacheOptions) -> CacheResult<()> {
    if let Commands::Health = command {
        return health(options).await;
    }

    let store = CacheStore::new(options)?;
    let tag = store.init().await?;
    debug!("Running as {}", tag);

    let result = match command {
        Commands::Get { key } => read::get(&store, &key).await,
        Commands::Keys { format } => read::keys(&store, format).await,
        Commands::Set { key, value, ttl } => write::set(&store, &key, value, ttl).await,
        Commands::Reset { key } => write::reset(&store, &key).await,
        Commands::Append {
            key,
            value,
            initial,
            ttl,
        } => write::append(&store, &key, value, initial, ttl).await,
        Commands::Remove {
            key,
            item,
            index,
            length,
            all,
        } => write::remove(&store, &key, item, index, length, all).await,
        Commands::Health => Ok(()),
    };

    store.shutdown().await;
    result
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> CacheResult<()> {
    let json = serde_json::to_string(value)?;
    println!("{}", json);
    Ok(())
}
