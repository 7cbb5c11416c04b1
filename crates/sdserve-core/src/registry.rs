//! Model registry: the directory listing is the index.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};

/// How a model came to be known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Provenance {
    /// Found in (or fetched into) the managed model directory.
    #[serde(rename = "downloaded")]
    Downloaded,
    /// Loaded from an arbitrary path outside the registry.
    #[serde(rename = "local-path")]
    LocalPath,
}

/// Lightweight record identifying a model. Derived from the filesystem and
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub path: PathBuf,
    pub provenance: Provenance,
}

impl ModelDescriptor {
    pub fn downloaded(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            path,
            provenance: Provenance::Downloaded,
        }
    }

    pub fn local_path(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            path,
            provenance: Provenance::LocalPath,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    extensions: Vec<String>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(vec!["safetensors".to_string()])
    }
}

impl ModelRegistry {
    pub fn new(extensions: Vec<String>) -> Self {
        let extensions = extensions
            .into_iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        Self { extensions }
    }

    fn is_model_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|known| *known == ext)
            })
            .unwrap_or(false)
    }

    /// Sorted filenames of model artifacts in `directory`.
    ///
    /// Only presence is checked; corrupt files surface at load time. A missing
    /// directory lists as empty.
    pub fn list_models(&self, directory: &Path) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.path())
            .filter(|path| self.is_model_file(path))
            .filter_map(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Look `name` up among the artifacts in `directory`.
    pub fn resolve(&self, directory: &Path, name: &str) -> Result<ModelDescriptor> {
        let not_found = || Error::ModelNotFound {
            name: name.to_string(),
            directory: directory.to_path_buf(),
        };

        if name.is_empty() {
            return Err(not_found());
        }
        if !self.list_models(directory)?.iter().any(|known| known == name) {
            return Err(not_found());
        }

        Ok(ModelDescriptor::downloaded(name, directory.join(name)))
    }
}
