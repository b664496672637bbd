//! `suprsync`: replicate files to a remote archive and finalize it bucket by
//! bucket.
//!
//! `suprsync run` drives the daemon loop; every other subcommand inspects or
//! adjusts the file record store. Configuration is described in
//! `suprsync-config`.

mod cli;
mod commands;
mod error;
mod logging;

use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    logging::init();
    match commands::execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        },
    }
}
