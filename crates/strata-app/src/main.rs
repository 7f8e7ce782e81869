//! The `strata` binary.
//!
//! Run with: `cargo run -p strata-app -- --mode host --ticks 600`

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use strata_app::{AppError, RunOptions, RunSummary, run_host, run_join, run_offline};
use strata_config::{CliArgs, Config, RunMode, default_config_dir};
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config from {}: {e}", config_dir.display());
            Config::default()
        }
    };
    config.apply_cli_overrides(&args);

    let log_dir = config
        .debug
        .log_to_file
        .then(|| config.world.save_root().join("logs"));
    strata_log::init_logging(log_dir.as_deref(), cfg!(debug_assertions), Some(&config));
    info!(mode = ?args.mode, seed = config.world.seed, config = %config_dir.display(), "starting strata");

    match run(args.mode, &config, args.ticks) {
        Ok(summary) => {
            info!(
                steps = summary.steps,
                reason = ?summary.reason,
                torches = summary.spawned,
                entities = summary.entities,
                "stopped"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "strata failed");
            ExitCode::FAILURE
        }
    }
}

fn run(mode: RunMode, config: &Config, ticks: Option<u64>) -> Result<RunSummary, AppError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("strata-net")
        .enable_all()
        .build()?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        runtime.spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupted, saving");
                    stop.store(true, Ordering::Relaxed);
                }
                Err(e) => warn!(error = %e, "no Ctrl-C handler"),
            }
        });
    }

    let options = RunOptions {
        ticks,
        stop,
        ..RunOptions::default()
    };
    match mode {
        RunMode::Offline => run_offline(config, &options),
        RunMode::Host => run_host(&runtime, config, &options),
        RunMode::Join => run_join(&runtime, config, &options),
    }
}
