//! Configuration types for the sdserve service

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable naming the model directory at startup.
pub const MODEL_DIR_ENV: &str = "SD_MODEL_DIR";

/// Main service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Startup override for the model directory. Takes precedence over
    /// `SD_MODEL_DIR` and the platform default.
    #[serde(default)]
    pub models_dir: Option<PathBuf>,

    /// Inference worker settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Timeout for a single artifact download (seconds)
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// What a directory change does while a load is in flight
    #[serde(default)]
    pub directory_change_policy: DirectoryChangePolicy,

    /// File extensions recognized as model artifacts
    #[serde(default = "default_model_extensions")]
    pub model_extensions: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            models_dir: None,
            engine: EngineConfig::default(),
            download_timeout_secs: default_download_timeout_secs(),
            directory_change_policy: DirectoryChangePolicy::default(),
            model_extensions: default_model_extensions(),
        }
    }
}

/// Policy for `set_directory` calls that arrive while a model is loading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryChangePolicy {
    /// The change is accepted and only affects operations that start later.
    #[default]
    ApplyToSubsequent,
    /// The change is rejected with `Busy` until the load settles.
    RejectWhileLoading,
}

/// Inference worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker executable. Loads fail when unset.
    #[serde(default = "default_engine_command")]
    pub command: Option<String>,

    /// Extra arguments passed to the worker
    #[serde(default)]
    pub args: Vec<String>,

    /// Device the worker should place the pipeline on
    #[serde(default = "default_device")]
    pub device: String,

    /// Weight dtype requested from the worker
    #[serde(default = "default_dtype")]
    pub dtype: String,

    /// How long a worker may take to report a loaded pipeline (seconds)
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,

    /// How long one generation may run before the worker is stopped (seconds)
    #[serde(default = "default_generate_timeout_secs")]
    pub generate_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            args: Vec::new(),
            device: default_device(),
            dtype: default_dtype(),
            load_timeout_secs: default_load_timeout_secs(),
            generate_timeout_secs: default_generate_timeout_secs(),
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn default_engine_command() -> Option<String> {
    env_non_empty("SD_ENGINE_CMD")
}

fn default_device() -> String {
    env_non_empty("SD_ENGINE_DEVICE").unwrap_or_else(|| "cuda".to_string())
}

fn default_dtype() -> String {
    env_non_empty("SD_ENGINE_DTYPE").unwrap_or_else(|| "float16".to_string())
}

fn default_load_timeout_secs() -> u64 {
    600
}

fn default_generate_timeout_secs() -> u64 {
    300
}

fn default_download_timeout_secs() -> u64 {
    3600
}

fn default_model_extensions() -> Vec<String> {
    vec!["safetensors".to_string()]
}

/// Model directory named by `SD_MODEL_DIR`, if set and non-empty.
pub fn env_models_dir() -> Option<PathBuf> {
    env_non_empty(MODEL_DIR_ENV).map(PathBuf::from)
}
