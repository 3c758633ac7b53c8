use dlsched_core::logging::{self, LogDestination};

mod cli;
mod fetch;

use clap::Parser;

use crate::cli::{Cli, CliCommand};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let destination = match cli.command {
        CliCommand::Worker { .. } => LogDestination::Stderr,
        _ => LogDestination::StateFile,
    };
    logging::init(destination);

    if let Err(err) = cli.command.run().await {
        eprintln!("dlsched error: {:#}", err);
        std::process::exit(1);
    }
}
