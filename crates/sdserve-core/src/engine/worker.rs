//! Out-of-process inference worker.
//!
//! Each loaded pipeline owns one worker process. Requests and responses are
//! single-line JSON documents over the worker's stdin/stdout:
//!
//! ```text
//! -> {"command":"load","model_path":"...","format":"safetensors","device":"cuda","dtype":"float16"}
//! <- {"status":"ready"}
//! -> {"command":"generate","prompt":"...","params":{"num_inference_steps":20}}
//! <- {"status":"ok","output":{"kind":"encoded","data":"<base64 png>"}}
//! -> {"command":"shutdown"}
//! ```
//!
//! Errors come back as `{"status":"error","error":"..."}`. Generated images
//! may be returned as an encoded image, a raw 8-bit pixel array, or a float
//! tensor (see [`WorkerOutput`]).

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    DeviceTensor, DiffusionPipeline, EngineOutput, GenerationParams, LoadSpec, ModelFormat,
    PipelineLoader, PixelArray, TensorLayout, ValueRange,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum WorkerRequest<'a> {
    Load {
        model_path: &'a Path,
        format: ModelFormat,
        device: &'a str,
        dtype: &'a str,
    },
    Generate {
        prompt: &'a str,
        params: &'a GenerationParams,
    },
    Shutdown,
}

#[derive(Debug, Deserialize)]
struct WorkerResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    output: Option<WorkerOutput>,
}

/// Image payload as produced by the worker. Binary data is base64.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WorkerOutput {
    /// An encoded image file (PNG, JPEG).
    Encoded { data: String },
    /// 8-bit HWC pixels.
    Array {
        width: u32,
        height: u32,
        channels: u8,
        data: String,
    },
    /// Little-endian f32 values.
    Tensor {
        shape: Vec<usize>,
        layout: TensorLayout,
        range: ValueRange,
        #[serde(default)]
        device: Option<String>,
        data: String,
    },
}

impl WorkerOutput {
    fn into_engine_output(self) -> Result<EngineOutput> {
        let decode = |data: &str| {
            base64::engine::general_purpose::STANDARD
                .decode(data.as_bytes())
                .map_err(|e| Error::Inference(format!("Base64 decode error: {}", e)))
        };

        match self {
            WorkerOutput::Encoded { data } => {
                let bytes = decode(&data)?;
                let image = image::load_from_memory(&bytes)
                    .map_err(|e| Error::Inference(format!("Failed to decode image: {}", e)))?;
                Ok(EngineOutput::Image(image))
            }
            WorkerOutput::Array {
                width,
                height,
                channels,
                data,
            } => Ok(EngineOutput::Array(PixelArray {
                width,
                height,
                channels,
                data: decode(&data)?,
            })),
            WorkerOutput::Tensor {
                shape,
                layout,
                range,
                device,
                data,
            } => {
                let bytes = decode(&data)?;
                if bytes.len() % 4 != 0 {
                    return Err(Error::Inference(format!(
                        "Tensor payload of {} bytes is not a whole number of f32 values",
                        bytes.len()
                    )));
                }
                let data = bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                Ok(EngineOutput::Tensor(DeviceTensor {
                    shape,
                    layout,
                    range,
                    device: device.unwrap_or_else(|| "unknown".to_string()),
                    data,
                }))
            }
        }
    }
}

/// Spawns one worker process per pipeline.
#[derive(Debug, Clone)]
pub struct WorkerLoader {
    command: Option<String>,
    args: Vec<String>,
    load_timeout: Duration,
    generate_timeout: Duration,
}

impl WorkerLoader {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            load_timeout: Duration::from_secs(config.load_timeout_secs),
            generate_timeout: Duration::from_secs(config.generate_timeout_secs),
        }
    }
}

impl PipelineLoader for WorkerLoader {
    fn load(&self, spec: &LoadSpec) -> Result<Box<dyn DiffusionPipeline>> {
        let command = self.command.as_deref().ok_or_else(|| {
            Error::Load("no inference worker configured (set SD_ENGINE_CMD)".to_string())
        })?;

        info!("Starting inference worker `{}` for {:?}", command, spec.model_path);
        let mut child = Command::new(command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Load(format!("Failed to start worker `{}`: {}", command, e)))?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Load("worker stdio unavailable".to_string()));
            }
        };

        // Lines are read on a dedicated thread so waits can time out.
        let (line_tx, line_rx) = mpsc::channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });

        let pipeline = WorkerPipeline {
            artifact: spec.model_path.clone(),
            channel: Mutex::new(WorkerChannel {
                stdin,
                lines: line_rx,
            }),
            child: Mutex::new(Some(child)),
            generate_timeout: self.generate_timeout,
            stopped: AtomicBool::new(false),
        };

        let request = WorkerRequest::Load {
            model_path: &spec.model_path,
            format: spec.format,
            device: &spec.device,
            dtype: &spec.dtype,
        };
        // On failure `pipeline` drops here and stops the worker.
        pipeline
            .exchange(&request, Some(self.load_timeout))
            .map_err(|e| match e {
                Error::Inference(msg) => Error::Load(msg),
                other => other,
            })?;

        info!("Worker ready for {:?}", spec.model_path);
        Ok(Box::new(pipeline))
    }
}

struct WorkerChannel {
    stdin: ChildStdin,
    lines: mpsc::Receiver<std::io::Result<String>>,
}

impl WorkerChannel {
    fn send(&mut self, request: &WorkerRequest<'_>) -> Result<()> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| Error::Inference(format!("Failed to serialize request: {}", e)))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.flush())
            .map_err(|e| Error::Inference(format!("Failed to write to worker: {}", e)))
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<WorkerResponse> {
        loop {
            let line = match timeout {
                Some(timeout) => self.lines.recv_timeout(timeout).map_err(|e| match e {
                    mpsc::RecvTimeoutError::Timeout => {
                        Error::Inference(format!("worker did not respond within {:?}", timeout))
                    }
                    mpsc::RecvTimeoutError::Disconnected => {
                        Error::Inference("worker exited".to_string())
                    }
                })?,
                None => self
                    .lines
                    .recv()
                    .map_err(|_| Error::Inference("worker exited".to_string()))?,
            };
            let line =
                line.map_err(|e| Error::Inference(format!("Failed to read from worker: {}", e)))?;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !trimmed.starts_with('{') {
                // Libraries inside the worker sometimes print to stdout.
                debug!("worker: {}", trimmed);
                continue;
            }
            return serde_json::from_str(trimmed)
                .map_err(|e| Error::Inference(format!("Malformed worker response: {}", e)));
        }
    }
}

struct WorkerPipeline {
    artifact: PathBuf,
    channel: Mutex<WorkerChannel>,
    child: Mutex<Option<Child>>,
    generate_timeout: Duration,
    /// Set once the worker was killed after a failed exchange.
    stopped: AtomicBool,
}

impl WorkerPipeline {
    /// Send `request` and wait for the reply. A worker that cannot be written
    /// to, stays silent past `timeout`, or sends an unparseable line is killed.
    fn exchange(
        &self,
        request: &WorkerRequest<'_>,
        timeout: Option<Duration>,
    ) -> Result<WorkerResponse> {
        let mut channel = self
            .channel
            .lock()
            .map_err(|_| Error::Inference("worker channel poisoned".to_string()))?;
        let response = match channel.send(request).and_then(|_| channel.receive(timeout)) {
            Ok(response) => response,
            Err(e) => {
                drop(channel);
                self.stop();
                return Err(e);
            }
        };

        match response.status.as_str() {
            "ok" | "ready" => Ok(response),
            _ => Err(Error::Inference(
                response
                    .error
                    .unwrap_or_else(|| format!("worker reported status `{}`", response.status)),
            )),
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let Ok(mut slot) = self.child.lock() else {
            return;
        };
        if let Some(mut child) = slot.take() {
            warn!("Stopping unresponsive worker for {:?}", self.artifact);
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl DiffusionPipeline for WorkerPipeline {
    fn artifact(&self) -> &Path {
        &self.artifact
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<EngineOutput> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Inference("worker is no longer running".to_string()));
        }
        let response = self.exchange(
            &WorkerRequest::Generate { prompt, params },
            Some(self.generate_timeout),
        )?;
        response
            .output
            .ok_or_else(|| Error::Inference("worker returned no image".to_string()))?
            .into_engine_output()
    }

    fn is_healthy(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerPipeline {
    fn drop(&mut self) {
        if let Ok(channel) = self.channel.get_mut() {
            let _ = channel.send(&WorkerRequest::Shutdown);
        }

        let Ok(slot) = self.child.get_mut() else {
            return;
        };
        let Some(mut child) = slot.take() else {
            return;
        };

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Worker for {:?} exited with {}", self.artifact, status);
                    return;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                _ => break,
            }
        }

        warn!("Worker for {:?} did not exit, killing it", self.artifact);
        let _ = child.kill();
        let _ = child.wait();
    }
}
