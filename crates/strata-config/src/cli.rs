//! Command-line argument parsing for Strata.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::Config;

/// Deployment role of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    /// Single player, chunks from local files.
    Offline,
    /// Hosting server that also plays.
    Host,
    /// Client connected to a host.
    Join,
}

/// Strata command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "strata", about = "Strata world streaming host/client")]
pub struct CliArgs {
    /// Offline, host or join.
    #[arg(long, value_enum, default_value_t = RunMode::Offline)]
    pub mode: RunMode,

    /// Server address.
    #[arg(long)]
    pub server: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// World seed.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Directory holding world saves.
    #[arg(long)]
    pub save_root: Option<PathBuf>,

    /// Number of simulation ticks before exiting (runs until Ctrl-C if unset).
    #[arg(long)]
    pub ticks: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(seed) = args.seed {
            self.world.seed = seed;
        }
        if let Some(ref root) = args.save_root {
            self.world.save_root = Some(root.clone());
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
