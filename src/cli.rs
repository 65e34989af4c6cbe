// SPDX-License-Identifier: Apache-2.0
//!
//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "conclave", about = "Orchestration kernel for a swarm of collaborating AI agents")]
pub struct Cli {
    /// Path to an orchestrator.yaml config layer, merged on top of the
    /// standard search paths.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Raise the log level: once for debug, twice for trace. Overrides the
    /// configured `log_level`.
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the three connection hubs and serve until shutdown (default).
    Serve,
    /// Print the fully merged configuration as YAML and exit.
    ShowConfig,
    /// Generate shell completion scripts.
    Completions { shell: clap_complete::Shell },
}
