//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level Strata configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// World geometry and save location.
    pub world: WorldConfig,
    /// Chunk window streaming tunables.
    pub streaming: StreamingConfig,
    /// Network/multiplayer settings.
    pub network: NetworkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// World geometry. The world is a horizontal cylinder: x wraps around
/// `planet_width_chunks`, y is clamped to `0..planet_height_chunks`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldConfig {
    /// Chunk side length in tiles.
    pub chunk_size: u32,
    /// Tile side length in world units.
    pub block_size: f32,
    /// Circumference of the world in chunks.
    pub planet_width_chunks: i32,
    /// Height of the world in chunks.
    pub planet_height_chunks: i32,
    /// World seed. Also names the world directory.
    pub seed: u64,
    /// Directory holding all worlds. `None` uses the platform data dir.
    pub save_root: Option<PathBuf>,
}

/// What a headless run does when a chunk cannot be loaded after all retries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CorruptChunkPolicy {
    /// Prompt on stdin.
    Ask,
    /// Regenerate from the terrain generator.
    Regenerate,
    /// Stop the session.
    Abort,
}

/// Chunk streaming tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Delay after crossing a chunk boundary before the window shifts.
    pub settle_ms: u64,
    /// Load attempts before a chunk is treated as corrupt.
    pub load_retry_attempts: u32,
    /// Base backoff between load attempts.
    pub load_retry_backoff_ms: u64,
    /// Worker threads for load/save/generation. 0 = derive from CPU count.
    pub worker_threads: usize,
    /// Freeze the simulation whenever the center slot is dirty.
    pub freeze_when_center_dirty: bool,
    /// Freeze when at least this fraction of the window is dirty.
    /// 0.0 freezes on any dirty slot.
    pub freeze_dirty_fraction: f32,
    /// Answer for the corrupt-chunk dialog in headless runs.
    pub on_corrupt_chunk: CorruptChunkPolicy,
}

/// Network/multiplayer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server address for multiplayer.
    pub server_address: String,
    /// Server port.
    pub server_port: u16,
    /// Client timeout in seconds.
    pub timeout_seconds: u32,
    /// Maximum number of players (server only).
    pub max_players: u32,
    /// Time a peer must stay on its center chunk before it may serve chunk
    /// data to others or simulate a region.
    pub dwell_threshold_ms: u64,
    /// Maximum payload of a single frame.
    pub max_frame_bytes: u32,
    /// Payloads larger than this are LZ4-compressed.
    pub compression_threshold: usize,
    /// Entity bound updates per second from the region authority.
    pub bound_update_rate_hz: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Write a JSON log file next to the world saves in debug builds.
    pub log_to_file: bool,
}

// --- Default implementations ---

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            chunk_size: 32,
            block_size: 16.0,
            planet_width_chunks: 64,
            planet_height_chunks: 16,
            seed: 0x5EED,
            save_root: None,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 150,
            load_retry_attempts: 3,
            load_retry_backoff_ms: 40,
            worker_threads: 0,
            freeze_when_center_dirty: true,
            freeze_dirty_fraction: 0.0,
            on_corrupt_chunk: CorruptChunkPolicy::Ask,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 7777,
            timeout_seconds: 30,
            max_players: 8,
            dwell_threshold_ms: 2_000,
            max_frame_bytes: 4 * 1024 * 1024,
            compression_threshold: 512,
            bound_update_rate_hz: 20,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

/// Platform config directory for Strata (`<config>/strata`).
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("strata")
}

/// Platform directory holding world saves (`<data>/strata/worlds`).
pub fn default_save_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("strata")
        .join("worlds")
}

impl WorldConfig {
    /// Resolved save root.
    pub fn save_root(&self) -> PathBuf {
        self.save_root.clone().unwrap_or_else(default_save_root)
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        new_config.validate()?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject values the streaming code cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.world.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "world.chunk_size",
                reason: "must be at least 1".into(),
            });
        }
        if !(self.world.block_size > 0.0) {
            return Err(ConfigError::Invalid {
                field: "world.block_size",
                reason: format!("must be positive, got {}", self.world.block_size),
            });
        }
        // The 3x3 window must not wrap onto itself.
        if self.world.planet_width_chunks < 3 {
            return Err(ConfigError::Invalid {
                field: "world.planet_width_chunks",
                reason: format!("must be at least 3, got {}", self.world.planet_width_chunks),
            });
        }
        if self.world.planet_height_chunks < 1 {
            return Err(ConfigError::Invalid {
                field: "world.planet_height_chunks",
                reason: format!("must be at least 1, got {}", self.world.planet_height_chunks),
            });
        }
        if !(0.0..=1.0).contains(&self.streaming.freeze_dirty_fraction) {
            return Err(ConfigError::Invalid {
                field: "streaming.freeze_dirty_fraction",
                reason: format!(
                    "must be within 0.0..=1.0, got {}",
                    self.streaming.freeze_dirty_fraction
                ),
            });
        }
        Ok(())
    }
}
