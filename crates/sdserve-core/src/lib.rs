//! sdserve Core - model management for a local image generation server
//!
//! This crate owns everything between the HTTP layer and the diffusion
//! runtime:
//! - resolving the model directory (override, `SD_MODEL_DIR`, platform default)
//! - listing model artifacts in that directory
//! - downloading artifacts idempotently with atomic publish
//! - the single active pipeline and its load/unload state machine
//! - running generations and normalizing engine output to PNG
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sdserve_core::{GenerationCoordinator, ModelLifecycle, ServiceConfig, WorkerLoader};
//!
//! let config = ServiceConfig::default();
//! let lifecycle = ModelLifecycle::new(&config, Arc::new(WorkerLoader::new(&config.engine)))?;
//! lifecycle.select_model("v1-5-pruned-emaonly.safetensors").await?;
//!
//! let image = GenerationCoordinator::new(lifecycle)
//!     .generate("a lighthouse at dusk", Default::default())
//!     .await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod generation;
pub mod lifecycle;
pub mod paths;
pub mod registry;

pub use config::{DirectoryChangePolicy, EngineConfig, ServiceConfig, MODEL_DIR_ENV};
pub use engine::{
    DeviceTensor, DiffusionPipeline, EngineOutput, GenerationParams, LoadSpec, ModelFormat,
    PipelineLoader, PixelArray, TensorLayout, ValueRange, WorkerLoader,
};
pub use error::{Error, Result};
pub use fetch::{ArtifactFetcher, FetchOutcome};
pub use generation::{GeneratedImage, GenerationCoordinator};
pub use lifecycle::{LifecycleStatus, ModelLifecycle, PipelinePhase};
pub use paths::{default_models_dir, DirectoryConfig, DirectorySource, PathResolver};
pub use registry::{ModelDescriptor, ModelRegistry, Provenance};
