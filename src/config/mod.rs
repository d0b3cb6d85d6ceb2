//! On-disk configuration for the engine's ambient settings

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::store::EngineMode;

/// Top-level engine configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Build parallelism and cluster-apply settings
    #[serde(default)]
    pub update_settings: UpdateSettingsConfig,

    /// How many completed builds each manifest keeps in its history
    #[serde(default = "default_build_history_limit")]
    pub build_history_limit: usize,

    /// Minimum length a reload-reported secret must have before it's scrubbed
    /// from the log store
    #[serde(default = "default_log_scrub_min_secret_len")]
    pub log_scrub_min_secret_len: usize,

    /// How long the Store batches actions before reducing them together
    #[serde(default = "default_batch_window_millis")]
    pub batch_window_millis: u64,

    /// Interactive ("up") vs one-shot CI run
    #[serde(default)]
    pub mode: EngineModeConfig,
}

fn default_build_history_limit() -> usize {
    15
}

fn default_log_scrub_min_secret_len() -> usize {
    4
}

fn default_batch_window_millis() -> u64 {
    20
}

impl EngineConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_millis)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            update_settings: UpdateSettingsConfig::default(),
            build_history_limit: default_build_history_limit(),
            log_scrub_min_secret_len: default_log_scrub_min_secret_len(),
            batch_window_millis: default_batch_window_millis(),
            mode: EngineModeConfig::default(),
        }
    }
}

/// Build parallelism and cluster-apply timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSettingsConfig {
    #[serde(default = "default_max_parallel_updates")]
    pub max_parallel_updates: usize,

    #[serde(default = "default_k8s_upsert_timeout_secs")]
    pub k8s_upsert_timeout_secs: u64,
}

fn default_max_parallel_updates() -> usize {
    1
}

fn default_k8s_upsert_timeout_secs() -> u64 {
    30
}

impl Default for UpdateSettingsConfig {
    fn default() -> Self {
        Self {
            max_parallel_updates: default_max_parallel_updates(),
            k8s_upsert_timeout_secs: default_k8s_upsert_timeout_secs(),
        }
    }
}

/// Serializable mirror of `EngineMode` (spec.md §3 distinguishes the two).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineModeConfig {
    #[default]
    Up,
    Ci,
}

impl From<EngineModeConfig> for EngineMode {
    fn from(value: EngineModeConfig) -> Self {
        match value {
            EngineModeConfig::Up => EngineMode::Up,
            EngineModeConfig::Ci => EngineMode::Ci,
        }
    }
}

/// Directory the engine stores its state and config under, following the
/// platform's conventional app-data locations.
pub fn get_data_dir() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("dev", "devloop", "devloop") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        home_dir().map(|h| h.join(".devloop")).unwrap_or_else(|| PathBuf::from(".devloop"))
    }
}

pub fn get_config_dir() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("dev", "devloop", "devloop") {
        proj_dirs.config_dir().to_path_buf()
    } else {
        get_data_dir()
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// Loads `config.toml` from the config dir, falling back to defaults when
/// absent or unparseable.
pub fn load_config() -> EngineConfig {
    let config_path = get_config_dir().join("config.toml");

    if config_path.exists() {
        if let Ok(contents) = std::fs::read_to_string(&config_path) {
            if let Ok(config) = toml::from_str(&contents) {
                return config;
            }
        }
    }

    EngineConfig::default()
}

pub fn save_config(config: &EngineConfig) -> std::io::Result<()> {
    let config_dir = get_config_dir();
    std::fs::create_dir_all(&config_dir)?;

    let config_path = config_dir.join("config.toml");
    let contents = toml::to_string_pretty(config).unwrap_or_default();
    std::fs::write(config_path, contents)?;

    Ok(())
}
