pub mod cli;
pub mod commands;
pub mod config;
pub mod logging;

use anyhow::{Context, Result};

pub use taskmaster_core as core;
pub use taskmaster_core::AppConfig;

/// Run one parsed invocation on an internal Tokio runtime, writing to stdout.
pub fn run_blocking(cli: cli::Cli) -> Result<()> {
    logging::init_tracing(cli.log_filter.clone())?;
    let config = config::from_cli(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    runtime.block_on(commands::execute(&config, cli.command, &mut handle))
}
