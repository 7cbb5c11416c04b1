//! Inference engine boundary.
//!
//! The diffusion runtime itself lives outside this crate. It is reached
//! through [`PipelineLoader`], which turns a validated artifact path into a
//! [`DiffusionPipeline`] handle. Handles return one of several output shapes
//! ([`EngineOutput`]); the generation coordinator is the only place that
//! looks at which one it got.

pub mod worker;

use std::path::{Path, PathBuf};

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use worker::WorkerLoader;

/// On-disk weight format, passed to the engine as a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    /// `.safetensors`, loaded with `use_safetensors`.
    Safetensors,
    /// Pickle-based checkpoints (`.ckpt`, `.pt`, `.bin`).
    Checkpoint,
}

impl ModelFormat {
    pub fn from_path(path: &Path) -> Self {
        let is_safetensors = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("safetensors"))
            .unwrap_or(false);
        if is_safetensors {
            ModelFormat::Safetensors
        } else {
            ModelFormat::Checkpoint
        }
    }
}

/// Everything the engine needs to build a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadSpec {
    pub model_path: PathBuf,
    pub format: ModelFormat,
    pub device: String,
    pub dtype: String,
}

/// Optional generation settings. Unset fields use engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Number of denoising iterations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_inference_steps: Option<u32>,

    /// Prompt adherence weight (classifier-free guidance)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

const MAX_DIMENSION: u32 = 4096;

impl GenerationParams {
    pub fn validate(&self) -> Result<()> {
        if self.num_inference_steps == Some(0) {
            return Err(Error::InvalidParams(
                "num_inference_steps must be at least 1".to_string(),
            ));
        }
        if let Some(scale) = self.guidance_scale {
            if !scale.is_finite() || scale < 0.0 {
                return Err(Error::InvalidParams(format!(
                    "guidance_scale must be a non-negative number, got {}",
                    scale
                )));
            }
        }
        for (label, value) in [("width", self.width), ("height", self.height)] {
            if let Some(value) = value {
                if value == 0 || value > MAX_DIMENSION {
                    return Err(Error::InvalidParams(format!(
                        "{} must be between 1 and {}, got {}",
                        label, MAX_DIMENSION, value
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Raw 8-bit pixels in row-major HWC order.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelArray {
    pub width: u32,
    pub height: u32,
    /// 1 (gray), 3 (RGB) or 4 (RGBA)
    pub channels: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// Channels first, optionally with a leading batch dimension of 1.
    Chw,
    /// Channels last, optionally with a leading batch dimension of 1.
    Hwc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueRange {
    /// Values in `[0, 1]`
    Unit,
    /// Values in `[-1, 1]`
    Symmetric,
}

/// Floating point tensor copied back from the compute device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTensor {
    pub shape: Vec<usize>,
    pub layout: TensorLayout,
    pub range: ValueRange,
    pub device: String,
    pub data: Vec<f32>,
}

/// The shapes an engine may hand back for a generated image.
#[derive(Debug, Clone)]
pub enum EngineOutput {
    Image(DynamicImage),
    Array(PixelArray),
    Tensor(DeviceTensor),
}

/// A loaded pipeline. Dropping it releases the engine resources.
pub trait DiffusionPipeline: Send + Sync {
    /// Artifact this pipeline was built from.
    fn artifact(&self) -> &Path;

    /// Run one generation. Blocking.
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<EngineOutput>;

    /// False once the pipeline can no longer serve requests.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Builds pipelines from artifacts. Blocking; failures are `Error::Load`.
pub trait PipelineLoader: Send + Sync {
    fn load(&self, spec: &LoadSpec) -> Result<Box<dyn DiffusionPipeline>>;
}
