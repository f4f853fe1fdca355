//! CLI commands

use ccrelay_config::Strategy;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ccrelay - run your assistant through a local load-balancing proxy
#[derive(Parser, Debug)]
#[command(name = "ccrelay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: ccrelay.{jsonc,json,yml,yaml} in the
    /// current directory, then ~/.config/ccrelay/)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Endpoint selection strategy (fallback, polling, speed-first)
    #[arg(short, long, global = true)]
    pub strategy: Option<Strategy>,

    /// Local proxy port
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// More output; repeat for debug logs
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start (or reuse) the proxy and run the assistant through it
    Run {
        /// Assistant executable
        #[arg(long, default_value = "claude")]
        command: String,

        /// Arguments passed to the assistant
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run the proxy in the foreground until Ctrl-C
    Serve,

    /// Show health of the running proxy
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List transformers and the binding of each configured endpoint
    Transformers,
}
