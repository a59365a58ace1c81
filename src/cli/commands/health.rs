//! Health command - reap dead siblings and report what was removed

use crate::cli::commands::print_json;
use crate::config::CacheOptions;
use crate::error::CacheResult;
use crate::queue::FileOperationQueue;
use console::style;

/// Execute the health command.
///
/// Runs a single pass without joining the queue, so this process never
/// publishes a heartbeat of its own.
pub async fn execute(options: CacheOptions) -> CacheResult<()> {
    let queue = FileOperationQueue::new(&options)?;
    let report = queue.health_check().await;

    if !report.removed_anything() {
        eprintln!("{} nothing to clean up", style("Healthy:").green());
    }
    print_json(&report)
}
