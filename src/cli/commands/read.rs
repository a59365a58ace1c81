//! Read commands - get and keys

use crate::cli::args::OutputFormat;
use crate::cli::commands::print_json;
use crate::error::CacheResult;
use crate::store::CacheStore;

/// Print the value of `key`, `null` when absent
pub async fn get(store: &CacheStore, key: &str) -> CacheResult<()> {
    let value = store.get(key).await?;
    print_json(&value)
}

/// Print every stored key
pub async fn keys(store: &CacheStore, format: OutputFormat) -> CacheResult<()> {
    let mut keys = store.keys().await?;
    keys.sort();

    match format {
        OutputFormat::Json => print_json(&keys)?,
        OutputFormat::Plain => {
            for key in keys {
                println!("{}", key);
            }
        }
    }
    Ok(())
}
