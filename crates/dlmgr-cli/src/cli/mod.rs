//! Top-level CLI surface: argument parsing and subcommand dispatch.

pub mod commands;
pub mod control_socket;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line interface for the segmented download manager.
#[derive(Debug, Parser)]
#[command(name = "dlmgr", version, about = "Segmented download manager", long_about = None)]
pub struct Cli {
    /// Enable debug-level logging.
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Queue a URL for download.
    Add {
        /// Direct HTTP/HTTPS URL to download.
        url: String,

        /// Destination directory (defaults to the configured download dir).
        #[arg(long, value_name = "DIR")]
        download_dir: Option<PathBuf>,

        /// Queue to add the download to.
        #[arg(long, default_value = "Main")]
        queue: String,
    },

    /// Run the scheduler: dispatches queued downloads, serves the local
    /// ingress HTTP API, and applies queue schedules until interrupted.
    Run {
        /// Port for the local ingress HTTP API.
        #[arg(long, default_value_t = 7890)]
        port: u16,
    },

    /// Show every item in the registry and its current status.
    Status,

    /// Request a running download stop gracefully, leaving it resumable.
    Pause {
        /// Item id, as printed by `add` or `status`.
        id: String,
    },

    /// Re-admit a stopped or failed item for another dispatch attempt.
    Resume {
        /// Item id, as printed by `add` or `status`.
        id: String,
    },

    /// Drop an item from the registry. Does not delete any partial files on disk.
    Remove {
        /// Item id, as printed by `add` or `status`.
        id: String,
    },

    /// Write the native-messaging manifest and install the shim binary so a
    /// browser extension can reach this app over stdio.
    RegisterExtension {
        /// The extension's id.
        extension_id: String,

        /// Browser to register for: chrome, chromium, brave, edge, firefox.
        #[arg(long, default_value = "chrome")]
        browser: String,
    },

    /// Print a shell completion script to stdout.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },

    /// Native-messaging host mode: the browser launches the installed shim
    /// (a copy of this same binary, per `register-extension`) with this flag,
    /// and talks to it over length-prefixed stdio JSON instead of argv.
    #[command(hide = true)]
    NativeMessagingShim,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub async fn dispatch(self) -> Result<()> {
        match self.command {
            CliCommand::Add { url, download_dir, queue } => commands::add::run(url, download_dir, queue).await,
            CliCommand::Run { port } => commands::run::run(port).await,
            CliCommand::Status => commands::status::run().await,
            CliCommand::Pause { id } => commands::pause::run(id).await,
            CliCommand::Resume { id } => commands::resume::run(id).await,
            CliCommand::Remove { id } => commands::remove::run(id).await,
            CliCommand::RegisterExtension { extension_id, browser } => {
                commands::register::run(extension_id, browser)
            }
            CliCommand::Completions { shell } => commands::completions::run(shell),
            CliCommand::NativeMessagingShim => commands::native_messaging_shim::run().await,
        }
    }
}

#[cfg(test)]
mod tests;
