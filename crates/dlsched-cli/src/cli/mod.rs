//! CLI for the dlsched download scheduler.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dlsched_core::config;

use commands::{run_config, run_downloads, run_worker, RunArgs};

/// Top-level CLI for the dlsched download scheduler.
#[derive(Debug, Parser)]
#[command(name = "dlsched")]
#[command(about = "dlsched: fair, rate-limited download scheduler", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Submit URLs for one user, show progress, then print perf and session summaries.
    Run {
        /// Chat user the jobs are submitted for (quotas are per user).
        #[arg(long, value_name = "ID")]
        user: i64,
        /// Submit with admin priority.
        #[arg(long)]
        admin: bool,
        /// Declared size in MB for every URL (drives priority class and isolation).
        #[arg(long, value_name = "N")]
        size_mb: Option<u64>,
        /// Platform label for metrics (derived from the URL host when absent).
        #[arg(long)]
        platform: Option<String>,
        /// Directory downloads are written to (default: current directory).
        #[arg(long, value_name = "DIR")]
        out: Option<PathBuf>,
        /// One or more HTTP/HTTPS URLs.
        #[arg(required = true, num_args = 1..)]
        urls: Vec<String>,
    },

    /// Print the effective configuration (file plus environment overrides).
    Config,

    /// Isolated worker entrypoint: one JSON request on stdin, progress and result on stdout.
    #[command(hide = true)]
    Worker {
        /// Directory the download is written to.
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
    },
}

impl CliCommand {
    pub async fn run(self) -> Result<()> {
        match self {
            CliCommand::Run {
                user,
                admin,
                size_mb,
                platform,
                out,
                urls,
            } => {
                let cfg = config::load_or_init()?;
                tracing::debug!("loaded config: {:?}", cfg);
                let out_dir = match out {
                    Some(dir) => dir,
                    None => std::env::current_dir()?,
                };
                let args = RunArgs {
                    user,
                    admin,
                    size_mb,
                    platform,
                    out_dir,
                    urls,
                };
                run_downloads(cfg, args).await?;
            }
            CliCommand::Config => {
                let cfg = config::load_or_init()?;
                run_config(&cfg, &config::config_path()?)?;
            }
            CliCommand::Worker { out } => run_worker(&out).await?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
