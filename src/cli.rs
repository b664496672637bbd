use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Replicate files to a remote archive, verify them, and finalize time buckets.
#[derive(Debug, Parser)]
#[command(name = "suprsync", author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(global = true, short, long)]
    pub config: Option<PathBuf>,

    /// Override the store path from the configuration
    #[arg(global = true, long)]
    pub db: Option<PathBuf>,

    /// Override the archive name from the configuration
    #[arg(global = true, short, long)]
    pub archive: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the sync daemon until interrupted
    Run,

    /// Register a file to be copied
    Register {
        /// Local file
        local: PathBuf,
        /// Destination, relative to the archive base directory
        remote: String,
        /// Never delete the local file
        #[arg(long)]
        keep: bool,
    },

    /// Show the records for a local file
    Check {
        file: PathBuf,
    },

    /// List the files the next copy batch would send
    Next,

    /// List every file of the archive
    List,

    /// Register every file below a directory that is not registered yet
    AddLocalFiles {
        /// Directory whose layout mirrors the archive
        root: PathBuf,
        /// Never delete the local files
        #[arg(long)]
        keep: bool,
    },

    /// Print archive statistics as JSON
    Stats,

    /// Reset the failed copy attempts of a record
    Retry {
        id: i64,
    },

    /// Allow or forbid deleting a record's local file
    SetDeletable {
        id: i64,
        #[arg(action = clap::ArgAction::Set)]
        deletable: bool,
    },
}
