//! VM Telemetry CLI
//!
//! Operator tool for inspecting and preparing metrics exchange disks.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::disk;
use std::path::PathBuf;

/// VM Telemetry CLI
#[derive(Parser)]
#[command(name = "vmtctl")]
#[command(author, version, about = "CLI for VM Telemetry exchange disks", long_about = None)]
pub struct Cli {
    /// Output format
    #[arg(long, short, global = true, env = "VMTCTL_FORMAT", default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an empty exchange disk
    Create {
        /// Path of the disk file
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the header of an exchange disk
    Header {
        /// Path of the disk file
        path: PathBuf,
    },

    /// Print the metrics document published on an exchange disk
    Dump {
        /// Path of the disk file
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Create { path, force } => disk::create(&path, force)?,
        Commands::Header { path } => disk::show_header(&path, cli.format)?,
        Commands::Dump { path } => disk::dump(&path, cli.format)?,
    }

    Ok(())
}
