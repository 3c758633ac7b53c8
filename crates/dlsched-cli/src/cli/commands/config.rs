//! `dlsched config` – print the effective configuration.

use std::path::Path;

use anyhow::Result;
use dlsched_core::SchedulerConfig;

pub fn run_config(cfg: &SchedulerConfig, path: &Path) -> Result<()> {
    println!("# {} (environment overrides applied)", path.display());
    print!("{}", toml::to_string_pretty(cfg)?);
    Ok(())
}
