//! Configuration system for Strata.
//!
//! Settings persist to disk as a RON file, with CLI overrides via clap and
//! change detection for hot reload. Every section uses `#[serde(default)]`
//! so older files keep loading after new fields are added.

mod cli;
mod config;
mod error;

pub use cli::{CliArgs, RunMode};
pub use config::{
    Config, CorruptChunkPolicy, DebugConfig, NetworkConfig, StreamingConfig, WorldConfig,
    default_config_dir, default_save_root,
};
pub use error::ConfigError;
