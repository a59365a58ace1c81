//! file-mem-cache debug harness
//!
//! CLI entry point that runs one cache operation per invocation.

use clap::Parser;
use console::style;
use file_mem_cache::cli::{commands, Cli};
use file_mem_cache::config::{CacheOptions, ConfigLoader};
use file_mem_cache::error::CacheResult;
use std::path::Path;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> CacheResult<()> {
    let cli = Cli::parse();

    // 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("file_mem_cache=warn"),
        1 => EnvFilter::new("file_mem_cache=info"),
        _ => EnvFilter::new("file_mem_cache=debug"),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.without_time().init();
    }

    let mut options = match &cli.config {
        Some(path) => ConfigLoader::with_path(path.clone()).load().await?,
        None => CacheOptions::default(),
    };

    if let Some(workdir) = cli.workdir {
        options.workdir = workdir;
    }
    if let Some(heartbeat_ms) = cli.heartbeat_ms {
        options.heartbeat_timeout_ms = heartbeat_ms;
    }
    if let Some(grace_ms) = cli.grace_ms {
        options.startup_grace_ms = Some(grace_ms);
    }
    if cli.tag.is_some() {
        options.process_tag = cli.tag;
    }
    options.validate(cli.config.as_deref().unwrap_or(Path::new("<command line>")))?;

    debug!("Using work directory {}", options.workdir.display());
    commands::execute(cli.command, options).await
}
