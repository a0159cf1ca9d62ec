pub use taskmaster_core::config::*;

use crate::cli::Cli;

pub fn from_cli(cli: &Cli) -> anyhow::Result<AppConfig> {
    let config = AppConfig::discover(cli.data_dir.clone())?;
    Ok(match cli.layout {
        Some(layout) => config.with_layout(layout),
        None => config,
    })
}
