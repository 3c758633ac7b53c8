//! CLI command handlers, one file per command.

mod config;
mod run;
mod worker;

pub use config::run_config;
pub use run::{format_perf, format_progress, format_session, run_downloads, RunArgs};
pub use worker::run_worker;
