//! Generation requests against the active pipeline.
//!
//! Engines return images in whichever shape is natural to them. This module
//! normalizes every [`EngineOutput`] variant to an in-memory PNG so nothing
//! past this point needs to know which one was produced.

use std::io::Cursor;
use std::time::Instant;

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use tracing::{debug, info};

use crate::engine::{
    DeviceTensor, EngineOutput, GenerationParams, PixelArray, TensorLayout, ValueRange,
};
use crate::error::{Error, Result};
use crate::lifecycle::ModelLifecycle;

/// A generated image, PNG-encoded.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Name of the model that produced the image
    pub model: String,
    pub generation_time_ms: f64,
}

#[derive(Clone)]
pub struct GenerationCoordinator {
    lifecycle: ModelLifecycle,
}

impl GenerationCoordinator {
    pub fn new(lifecycle: ModelLifecycle) -> Self {
        Self { lifecycle }
    }

    /// Generate one image from `prompt` with the loaded model.
    pub async fn generate(&self, prompt: &str, params: GenerationParams) -> Result<GeneratedImage> {
        if prompt.trim().is_empty() {
            return Err(Error::InvalidPrompt);
        }
        params.validate()?;

        let pipeline = self.lifecycle.acquire_ready().await?;
        let lifecycle = self.lifecycle.clone();
        let prompt = prompt.to_string();

        // Runs on its own task so a pipeline that fails is retired even when
        // the caller has stopped waiting.
        tokio::spawn(async move {
            // The read guard moves into the blocking task so the handle cannot
            // be released until inference returns.
            let (result, failed) = tokio::task::spawn_blocking(move || {
                let started = Instant::now();
                let descriptor = pipeline.descriptor.clone();
                info!("Generating with {}: {} chars", descriptor.name, prompt.len());

                let output = pipeline.handle.generate(&prompt, &params);
                let healthy = pipeline.handle.is_healthy();
                drop(pipeline);

                let result = output.and_then(|output| render(output, &descriptor.name, started));
                (result, (!healthy).then_some(descriptor))
            })
            .await
            .map_err(|e| Error::Inference(format!("generation task failed: {}", e)))?;

            if let Some(descriptor) = failed {
                let reason = match &result {
                    Err(e) => e.to_string(),
                    Ok(_) => "pipeline stopped after generating".to_string(),
                };
                lifecycle.retire(descriptor, reason).await;
            }
            result
        })
        .await
        .map_err(|e| Error::Inference(format!("generation task failed: {}", e)))?
    }
}

fn render(output: EngineOutput, model: &str, started: Instant) -> Result<GeneratedImage> {
    let image = normalize(output)?;
    let png = encode_png(&image)?;
    let generation_time_ms = started.elapsed().as_secs_f64() * 1000.0;
    debug!(
        "Encoded {}x{} image ({} bytes) in {:.1}ms",
        image.width(),
        image.height(),
        png.len(),
        generation_time_ms
    );

    Ok(GeneratedImage {
        png,
        width: image.width(),
        height: image.height(),
        model: model.to_string(),
        generation_time_ms,
    })
}

/// Convert any engine output shape into a decoded image.
pub fn normalize(output: EngineOutput) -> Result<DynamicImage> {
    match output {
        EngineOutput::Image(image) => Ok(image),
        EngineOutput::Array(array) => from_pixel_array(array),
        EngineOutput::Tensor(tensor) => from_tensor(tensor),
    }
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| Error::Inference(format!("Failed to encode PNG: {}", e)))?;
    Ok(buf.into_inner())
}

fn from_pixel_array(array: PixelArray) -> Result<DynamicImage> {
    let PixelArray {
        width,
        height,
        channels,
        data,
    } = array;
    let expected = width as usize * height as usize * channels as usize;
    if data.len() != expected {
        return Err(Error::Inference(format!(
            "pixel array has {} bytes, expected {} for {}x{}x{}",
            data.len(),
            expected,
            width,
            height,
            channels
        )));
    }

    let image = match channels {
        1 => GrayImage::from_raw(width, height, data).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(width, height, data).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(width, height, data).map(DynamicImage::ImageRgba8),
        other => {
            return Err(Error::Inference(format!(
                "unsupported channel count {}",
                other
            )))
        }
    };
    image.ok_or_else(|| Error::Inference("pixel buffer does not match dimensions".to_string()))
}

fn from_tensor(tensor: DeviceTensor) -> Result<DynamicImage> {
    debug!("Copying {:?} tensor from {}", tensor.shape, tensor.device);

    let dims: &[usize] = match tensor.shape.as_slice() {
        [1, rest @ ..] if rest.len() == 3 => rest,
        dims if dims.len() == 3 => dims,
        other => {
            return Err(Error::Inference(format!(
                "expected a 3-d image tensor, got shape {:?}",
                other
            )))
        }
    };
    let (channels, height, width) = match tensor.layout {
        TensorLayout::Chw => (dims[0], dims[1], dims[2]),
        TensorLayout::Hwc => (dims[2], dims[0], dims[1]),
    };
    if tensor.data.len() != channels * height * width {
        return Err(Error::Inference(format!(
            "tensor has {} values, shape {:?} needs {}",
            tensor.data.len(),
            tensor.shape,
            channels * height * width
        )));
    }
    let (Ok(width_px), Ok(height_px), Ok(channel_count)) = (
        u32::try_from(width),
        u32::try_from(height),
        u8::try_from(channels),
    ) else {
        return Err(Error::Inference(format!(
            "tensor shape {:?} is too large",
            tensor.shape
        )));
    };

    let to_byte = |value: f32| -> u8 {
        let unit = match tensor.range {
            ValueRange::Unit => value,
            ValueRange::Symmetric => (value + 1.0) / 2.0,
        };
        if unit.is_nan() {
            0
        } else {
            (unit.clamp(0.0, 1.0) * 255.0).round() as u8
        }
    };

    let mut data = Vec::with_capacity(tensor.data.len());
    match tensor.layout {
        TensorLayout::Hwc => data.extend(tensor.data.iter().copied().map(to_byte)),
        TensorLayout::Chw => {
            let plane = height * width;
            for pixel in 0..plane {
                for channel in 0..channels {
                    data.push(to_byte(tensor.data[channel * plane + pixel]));
                }
            }
        }
    }

    from_pixel_array(PixelArray {
        width: width_px,
        height: height_px,
        channels: channel_count,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::DirectoryChangePolicy;
    use crate::lifecycle::tests::{lifecycle_in, scratch_dir, FakeLoader};
    use crate::lifecycle::PipelinePhase;

    #[test]
    fn passes_decoded_images_through() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, image::Rgb([1, 2, 3])));
        let normalized = normalize(EngineOutput::Image(image.clone())).unwrap();
        assert_eq!(normalized, image);
    }

    #[test]
    fn converts_pixel_arrays_by_channel_count() {
        let gray = normalize(EngineOutput::Array(PixelArray {
            width: 2,
            height: 1,
            channels: 1,
            data: vec![0, 255],
        }))
        .unwrap();
        assert!(matches!(gray, DynamicImage::ImageLuma8(_)));

        let rgba = normalize(EngineOutput::Array(PixelArray {
            width: 1,
            height: 1,
            channels: 4,
            data: vec![1, 2, 3, 4],
        }))
        .unwrap();
        assert_eq!(rgba.to_rgba8().get_pixel(0, 0).0, [1, 2, 3, 4]);

        let mismatched = normalize(EngineOutput::Array(PixelArray {
            width: 2,
            height: 2,
            channels: 3,
            data: vec![0; 5],
        }));
        assert!(matches!(mismatched, Err(Error::Inference(_))));
    }

    #[test]
    fn converts_chw_tensors_with_batch_dimension() {
        // 1x3x1x2: red plane, green plane, blue plane.
        let tensor = DeviceTensor {
            shape: vec![1, 3, 1, 2],
            layout: TensorLayout::Chw,
            range: ValueRange::Symmetric,
            device: "cuda:0".to_string(),
            data: vec![1.0, -1.0, -1.0, 1.0, 0.0, 2.0],
        };
        let image = normalize(EngineOutput::Tensor(tensor)).unwrap().to_rgb8();
        assert_eq!(image.dimensions(), (2, 1));
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 128]);
        assert_eq!(image.get_pixel(1, 0).0, [0, 255, 255]);
    }

    #[test]
    fn converts_hwc_unit_tensors() {
        let tensor = DeviceTensor {
            shape: vec![1, 1, 3],
            layout: TensorLayout::Hwc,
            range: ValueRange::Unit,
            device: "cpu".to_string(),
            data: vec![0.0, f32::NAN, 1.0],
        };
        let image = normalize(EngineOutput::Tensor(tensor)).unwrap().to_rgb8();
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 255]);
    }

    #[test]
    fn rejects_non_image_tensors() {
        let tensor = DeviceTensor {
            shape: vec![2, 3, 4, 4],
            layout: TensorLayout::Chw,
            range: ValueRange::Unit,
            device: "cpu".to_string(),
            data: vec![0.0; 96],
        };
        assert!(matches!(
            normalize(EngineOutput::Tensor(tensor)),
            Err(Error::Inference(_))
        ));
    }

    #[test]
    fn encodes_png_signature() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        let png = encode_png(&image).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[tokio::test]
    async fn requires_a_loaded_model() {
        let dir = scratch_dir();
        let lifecycle = lifecycle_in(&dir, Arc::default(), DirectoryChangePolicy::default());
        let coordinator = GenerationCoordinator::new(lifecycle);

        let err = coordinator
            .generate("a cat", GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoModelLoaded));

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_regardless_of_phase() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("m.safetensors"), b"weights").unwrap();
        let lifecycle = lifecycle_in(&dir, Arc::default(), DirectoryChangePolicy::default());
        let coordinator = GenerationCoordinator::new(lifecycle.clone());

        for prompt in ["", "   "] {
            let err = coordinator
                .generate(prompt, GenerationParams::default())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidPrompt));
        }

        lifecycle.select_model("m.safetensors").await.unwrap();
        let err = coordinator
            .generate("", GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPrompt));

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn generates_png_with_requested_size() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("m.safetensors"), b"weights").unwrap();
        let lifecycle = lifecycle_in(&dir, Arc::default(), DirectoryChangePolicy::default());
        lifecycle.select_model("m.safetensors").await.unwrap();

        let params = GenerationParams {
            width: Some(8),
            height: Some(4),
            ..Default::default()
        };
        let image = GenerationCoordinator::new(lifecycle)
            .generate("A simple test image of a cat", params)
            .await
            .unwrap();
        assert_eq!((image.width, image.height), (8, 4));
        assert_eq!(image.model, "m.safetensors");
        let decoded = image::load_from_memory(&image.png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 4));

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn status_stays_responsive_during_generation() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("m.safetensors"), b"weights").unwrap();
        let loader = Arc::new(FakeLoader {
            generate_delay: Duration::from_millis(300),
            ..FakeLoader::default()
        });
        let lifecycle = lifecycle_in(&dir, loader, DirectoryChangePolicy::default());
        lifecycle.select_model("m.safetensors").await.unwrap();

        let coordinator = GenerationCoordinator::new(lifecycle.clone());
        let generation = tokio::spawn(async move {
            coordinator
                .generate("a cat", GenerationParams::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let status = lifecycle.status();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(status.phase, PipelinePhase::Ready);

        generation.await.unwrap().unwrap();
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn switching_models_waits_for_running_generation() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["a.safetensors", "b.safetensors"] {
            std::fs::write(dir.join(name), b"weights").unwrap();
        }
        let loader = Arc::new(FakeLoader {
            generate_delay: Duration::from_millis(300),
            ..FakeLoader::default()
        });
        let lifecycle = lifecycle_in(&dir, loader.clone(), DirectoryChangePolicy::default());
        lifecycle.select_model("a.safetensors").await.unwrap();

        let coordinator = GenerationCoordinator::new(lifecycle.clone());
        let generation = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .generate("a cat", GenerationParams::default())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        lifecycle.select_model("b.safetensors").await.unwrap();
        let image = generation.await.unwrap().unwrap();
        assert_eq!(image.model, "a.safetensors");

        let image = coordinator
            .generate("a dog", GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(image.model, "b.safetensors");

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn failed_pipeline_is_retired() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["flaky.safetensors", "b.safetensors"] {
            std::fs::write(dir.join(name), b"weights").unwrap();
        }
        let loader = Arc::new(FakeLoader {
            crash: ["flaky.safetensors".to_string()].into_iter().collect(),
            ..FakeLoader::default()
        });
        let lifecycle = lifecycle_in(&dir, loader.clone(), DirectoryChangePolicy::default());
        lifecycle.select_model("flaky.safetensors").await.unwrap();

        let coordinator = GenerationCoordinator::new(lifecycle.clone());
        let err = coordinator
            .generate("a cat", GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Inference(_)));

        let status = lifecycle.status();
        assert_eq!(status.phase, PipelinePhase::Error);
        assert_eq!(status.descriptor.unwrap().name, "flaky.safetensors");
        assert!(status.last_error.unwrap().contains("did not respond"));
        assert_eq!(loader.released.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(matches!(
            coordinator.generate("a cat", GenerationParams::default()).await,
            Err(Error::NoModelLoaded)
        ));

        lifecycle.select_model("b.safetensors").await.unwrap();
        coordinator
            .generate("a cat", GenerationParams::default())
            .await
            .unwrap();

        std::fs::remove_dir_all(dir).ok();
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn silent_worker_does_not_wedge_the_lifecycle() {
        use crate::config::{EngineConfig, ServiceConfig};
        use crate::engine::WorkerLoader;
        use crate::paths::PathResolver;

        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.safetensors"), b"weights").unwrap();

        let config = ServiceConfig {
            engine: EngineConfig {
                command: Some("sh".to_string()),
                args: vec![
                    "-c".to_string(),
                    r#"read l; echo '{"status":"ready"}'; exec sleep 30"#.to_string(),
                ],
                load_timeout_secs: 5,
                generate_timeout_secs: 1,
                ..EngineConfig::default()
            },
            ..ServiceConfig::default()
        };
        let loader = Arc::new(WorkerLoader::new(&config.engine));
        let resolver = PathResolver::new(None, dir.clone());
        let lifecycle = ModelLifecycle::with_resolver(resolver, &config, loader).unwrap();
        lifecycle.select_model("a.safetensors").await.unwrap();

        // The caller gives up before the worker deadline.
        let coordinator = GenerationCoordinator::new(lifecycle.clone());
        let abandoned = tokio::time::timeout(
            Duration::from_millis(200),
            coordinator.generate("a cat", GenerationParams::default()),
        )
        .await;
        assert!(abandoned.is_err());

        let reselect =
            tokio::time::timeout(Duration::from_secs(5), lifecycle.select_model("a.safetensors"))
                .await;
        assert!(matches!(reselect, Ok(Ok(_))));
        assert_eq!(lifecycle.status().phase, PipelinePhase::Ready);

        let unload = tokio::time::timeout(Duration::from_secs(5), lifecycle.unload()).await;
        assert!(matches!(unload, Ok(Ok(()))));

        std::fs::remove_dir_all(dir).ok();
    }
}
