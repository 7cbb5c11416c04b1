//! Error types for model management and generation

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Model directory could not be resolved or created.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Download failed: {0}")]
    Fetch(String),

    #[error("Model {name} not found in {}", directory.display())]
    ModelNotFound { name: String, directory: PathBuf },

    #[error("Model path {} not found", .0.display())]
    PathNotFound(PathBuf),

    /// The inference engine rejected the artifact.
    #[error("Failed to load model: {0}")]
    Load(String),

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("No prompt provided")]
    InvalidPrompt,

    #[error("Invalid generation parameters: {0}")]
    InvalidParams(String),

    /// Another load is already in flight.
    #[error("Busy: {0}")]
    Busy(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Invalid artifact name: {0}")]
    InvalidArtifactName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration_error",
            Error::Fetch(_) => "fetch_error",
            Error::ModelNotFound { .. } => "model_not_found",
            Error::PathNotFound(_) => "path_not_found",
            Error::Load(_) => "load_error",
            Error::NoModelLoaded => "no_model_loaded",
            Error::InvalidPrompt => "invalid_prompt",
            Error::InvalidParams(_) => "invalid_params",
            Error::Busy(_) => "busy",
            Error::Inference(_) => "inference_error",
            Error::InvalidArtifactName(_) => "invalid_artifact_name",
            Error::Io(_) => "io_error",
        }
    }
}
