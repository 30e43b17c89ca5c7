//! Configuration file support for the lift tools.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/lift/config.toml`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub caps: CapsConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Bounds enforced on every agent-facing read
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapsConfig {
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    #[serde(default = "default_limit")]
    pub default_limit: usize,

    #[serde(default = "default_max_weeks")]
    pub max_weeks: u32,

    /// Rows fetched for sorts the store cannot order natively
    #[serde(default = "default_candidate_window")]
    pub candidate_window: usize,

    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,

    #[serde(default = "default_max_exercise_ids")]
    pub max_exercise_ids: usize,

    #[serde(default = "default_top_exercises")]
    pub top_exercises: usize,
}

impl Default for CapsConfig {
    fn default() -> Self {
        Self {
            max_limit: default_max_limit(),
            default_limit: default_limit(),
            max_weeks: default_max_weeks(),
            candidate_window: default_candidate_window(),
            max_response_bytes: default_max_response_bytes(),
            max_exercise_ids: default_max_exercise_ids(),
            top_exercises: default_top_exercises(),
        }
    }
}

/// Write-path limits of the document store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_max_batch_ops")]
    pub max_batch_ops: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_batch_ops: default_max_batch_ops(),
        }
    }
}

/// Exercise catalog location
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct CatalogConfig {
    /// Defaults to `<data_dir>/catalog.toml` when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Lookup cache lifetimes
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_local_ttl_secs")]
    pub local_ttl_secs: u64,

    #[serde(default = "default_shared_ttl_secs")]
    pub shared_ttl_secs: u64,

    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_ttl_secs: default_local_ttl_secs(),
            shared_ttl_secs: default_shared_ttl_secs(),
            local_max_entries: default_local_max_entries(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local/share")
    });
    base.join("lift")
}

fn default_max_limit() -> usize {
    200
}

fn default_limit() -> usize {
    50
}

fn default_max_weeks() -> u32 {
    52
}

fn default_candidate_window() -> usize {
    1000
}

fn default_max_response_bytes() -> usize {
    64 * 1024
}

fn default_max_exercise_ids() -> usize {
    10
}

fn default_top_exercises() -> usize {
    5
}

fn default_max_batch_ops() -> usize {
    500
}

fn default_local_ttl_secs() -> u64 {
    60
}

fn default_shared_ttl_secs() -> u64 {
    3600
}

fn default_local_max_entries() -> usize {
    1024
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".config")
        });
        base.join("lift").join("config.toml")
    }

    /// Resolve the catalog file, falling back to the data directory
    pub fn catalog_path(&self, data_dir: &Path) -> PathBuf {
        self.catalog
            .path
            .clone()
            .unwrap_or_else(|| data_dir.join("catalog.toml"))
    }

    /// Reject settings that would make the caps meaningless
    pub fn validate(&self) -> Result<()> {
        if self.caps.max_limit == 0 {
            return Err(Error::Config("caps.max_limit must be at least 1".into()));
        }
        if self.caps.max_weeks == 0 {
            return Err(Error::Config("caps.max_weeks must be at least 1".into()));
        }
        if self.store.max_batch_ops == 0 {
            return Err(Error::Config("store.max_batch_ops must be at least 1".into()));
        }
        Ok(())
    }
}
