//! Model directory resolution.
//!
//! The active directory is, in priority order: the last explicit override,
//! the directory named by `SD_MODEL_DIR`, or a platform default.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::config::env_models_dir;
use crate::error::{Error, Result};

#[cfg(windows)]
const APP_DIR_NAME: &str = "StableDiffusionBackend";
#[cfg(not(windows))]
const APP_DIR_NAME: &str = "stable-diffusion-backend";

/// Platform default model directory. Pure, does not touch the filesystem.
///
/// Windows uses the roaming application data directory; everything else
/// uses `~/.local/share`, including macOS.
pub fn default_models_dir() -> PathBuf {
    #[cfg(windows)]
    let base = dirs::config_dir().or_else(dirs::home_dir);
    #[cfg(not(windows))]
    let base = dirs::home_dir().map(|home| home.join(".local").join("share"));

    base.unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join("models")
}

fn empty_path() -> Error {
    Error::Configuration("empty directory path".to_string())
}

fn create_failed(path: &Path, e: std::io::Error) -> Error {
    Error::Configuration(format!("cannot create {}: {}", path.display(), e))
}

fn not_a_directory(path: &Path) -> Error {
    Error::Configuration(format!("{} is not a directory", path.display()))
}

/// Create `path` (and parents) if missing.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(empty_path());
    }
    std::fs::create_dir_all(path).map_err(|e| create_failed(path, e))?;
    if !path.is_dir() {
        return Err(not_a_directory(path));
    }
    Ok(())
}

/// [`ensure_dir`] for async callers.
pub async fn ensure_dir_async(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(empty_path());
    }
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| create_failed(path, e))?;
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        _ => Err(not_a_directory(path)),
    }
}

/// Where the active directory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectorySource {
    Override,
    Environment,
    Default,
}

/// The currently active model directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryConfig {
    pub path: PathBuf,
    pub source: DirectorySource,
}

impl DirectoryConfig {
    /// Whether the directory was set explicitly rather than inherited.
    pub fn is_overridden(&self) -> bool {
        self.source == DirectorySource::Override
    }
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    override_dir: Option<PathBuf>,
    env_dir: Option<PathBuf>,
    default_dir: PathBuf,
}

impl PathResolver {
    pub fn new(env_dir: Option<PathBuf>, default_dir: PathBuf) -> Self {
        Self {
            override_dir: None,
            env_dir,
            default_dir,
        }
    }

    /// Resolver reading `SD_MODEL_DIR` and the platform default.
    pub fn from_env() -> Self {
        Self::new(env_models_dir(), default_models_dir())
    }

    pub fn with_override(mut self, dir: Option<PathBuf>) -> Self {
        self.override_dir = dir;
        self
    }

    /// Resolve the active directory without creating it.
    pub fn resolve(&self) -> DirectoryConfig {
        if let Some(path) = &self.override_dir {
            return DirectoryConfig {
                path: path.clone(),
                source: DirectorySource::Override,
            };
        }
        if let Some(path) = &self.env_dir {
            return DirectoryConfig {
                path: path.clone(),
                source: DirectorySource::Environment,
            };
        }
        DirectoryConfig {
            path: self.default_dir.clone(),
            source: DirectorySource::Default,
        }
    }

    /// Resolve the active directory, creating it if missing.
    pub fn activate(&self) -> Result<DirectoryConfig> {
        let active = self.resolve();
        ensure_dir(&active.path)?;
        debug!("Active model directory: {:?} ({:?})", active.path, active.source);
        Ok(active)
    }

    /// Make `path` the active directory. Callers create it first.
    pub fn set_override(&mut self, path: PathBuf) -> DirectoryConfig {
        self.override_dir = Some(path);
        self.resolve()
    }
}
