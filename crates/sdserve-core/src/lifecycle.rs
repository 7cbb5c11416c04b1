//! Model lifecycle management.
//!
//! Owns the single active pipeline. At most one load runs at a time; a load
//! requested while another is in flight is rejected with [`Error::Busy`].
//! The pipeline slot sits behind a read-write lock: generations hold the
//! shared side for the whole inference call, transitions take the exclusive
//! side, so a handle is never swapped out from under a running generation.
//! Status reads go through a separate watch channel and never wait on either.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, RwLock};
use tracing::{info, warn};

use crate::config::{DirectoryChangePolicy, EngineConfig, ServiceConfig};
use crate::engine::{DiffusionPipeline, LoadSpec, ModelFormat, PipelineLoader};
use crate::error::{Error, Result};
use crate::fetch::{ArtifactFetcher, FetchOutcome};
use crate::paths::{ensure_dir_async, DirectoryConfig, PathResolver};
use crate::registry::{ModelDescriptor, ModelRegistry};

/// Lifecycle phase of the active pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Unloaded,
    Loading,
    Ready,
    /// The loaded pipeline failed while serving and was released. Generation
    /// is refused as when unloaded; the next load or unload leaves this phase.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PhaseState {
    phase: PipelinePhase,
    descriptor: Option<ModelDescriptor>,
    last_error: Option<String>,
}

/// Point-in-time view of the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleStatus {
    pub phase: PipelinePhase,
    /// The ready model, the model being loaded, or the one that failed.
    pub descriptor: Option<ModelDescriptor>,
    pub directory: DirectoryConfig,
    /// Message of the most recent failure, cleared by the next successful load.
    pub last_error: Option<String>,
}

/// A loaded pipeline together with the descriptor it was loaded for.
pub(crate) struct ActivePipeline {
    pub(crate) descriptor: ModelDescriptor,
    pub(crate) handle: Box<dyn DiffusionPipeline>,
}

/// Shared access to the ready pipeline, held for the duration of a generation.
pub(crate) type ReadyPipeline = OwnedRwLockReadGuard<Option<ActivePipeline>, ActivePipeline>;

struct LifecycleInner {
    resolver: StdRwLock<PathResolver>,
    registry: ModelRegistry,
    fetcher: ArtifactFetcher,
    loader: Arc<dyn PipelineLoader>,
    engine: EngineConfig,
    policy: DirectoryChangePolicy,
    pipeline: Arc<RwLock<Option<ActivePipeline>>>,
    load_gate: Arc<Mutex<()>>,
    state: watch::Sender<PhaseState>,
}

/// Handle to the process-wide model lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct ModelLifecycle {
    inner: Arc<LifecycleInner>,
}

impl ModelLifecycle {
    /// Build the lifecycle from configuration and the environment.
    ///
    /// Fails if the startup model directory cannot be created.
    pub fn new(config: &ServiceConfig, loader: Arc<dyn PipelineLoader>) -> Result<Self> {
        let resolver = PathResolver::from_env().with_override(config.models_dir.clone());
        Self::with_resolver(resolver, config, loader)
    }

    pub fn with_resolver(
        resolver: PathResolver,
        config: &ServiceConfig,
        loader: Arc<dyn PipelineLoader>,
    ) -> Result<Self> {
        let directory = resolver.activate()?;
        info!("Models directory: {:?}", directory.path);

        let fetcher = ArtifactFetcher::new(Duration::from_secs(config.download_timeout_secs))?;
        let (state, _) = watch::channel(PhaseState {
            phase: PipelinePhase::Unloaded,
            descriptor: None,
            last_error: None,
        });

        Ok(Self {
            inner: Arc::new(LifecycleInner {
                resolver: StdRwLock::new(resolver),
                registry: ModelRegistry::new(config.model_extensions.clone()),
                fetcher,
                loader,
                engine: config.engine.clone(),
                policy: config.directory_change_policy,
                pipeline: Arc::new(RwLock::new(None)),
                load_gate: Arc::new(Mutex::new(())),
                state,
            }),
        })
    }

    /// Active model directory (not created).
    pub fn directory(&self) -> DirectoryConfig {
        self.inner
            .resolver
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve()
    }

    /// Active model directory, created if it went missing.
    async fn active_directory(&self) -> Result<DirectoryConfig> {
        let active = self.directory();
        ensure_dir_async(&active.path).await?;
        Ok(active)
    }

    /// Change the active directory. Does not touch a loaded pipeline.
    pub async fn set_directory(&self, path: PathBuf) -> Result<DirectoryConfig> {
        if self.inner.policy == DirectoryChangePolicy::RejectWhileLoading
            && self.inner.state.borrow().phase == PipelinePhase::Loading
        {
            return Err(Error::Busy(
                "cannot change the model directory while a model is loading".to_string(),
            ));
        }

        ensure_dir_async(&path).await?;
        let updated = self
            .inner
            .resolver
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_override(path);
        info!("Model directory updated to {:?}", updated.path);
        Ok(updated)
    }

    /// Artifact names in the active directory.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let directory = self.active_directory().await?;
        let inner = self.inner.clone();
        blocking(move || inner.registry.list_models(&directory.path)).await
    }

    /// Download an artifact into `directory`, or the active directory.
    pub async fn fetch(
        &self,
        url: &str,
        filename: &str,
        directory: Option<PathBuf>,
    ) -> Result<(FetchOutcome, PathBuf)> {
        let target = match directory {
            Some(dir) => dir,
            None => self.active_directory().await?.path,
        };
        let outcome = self.inner.fetcher.fetch(url, filename, &target).await?;
        Ok((outcome, target))
    }

    /// Load `name` from the active directory, replacing any loaded model.
    pub async fn select_model(&self, name: &str) -> Result<ModelDescriptor> {
        let directory = self.active_directory().await?;
        let inner = self.inner.clone();
        let name = name.to_string();
        let descriptor = blocking(move || inner.registry.resolve(&directory.path, &name)).await?;
        self.load(descriptor).await
    }

    /// Load an artifact from an arbitrary path. `name` is a display label and
    /// defaults to the file name.
    pub async fn load_from_path(
        &self,
        path: &Path,
        name: Option<String>,
    ) -> Result<ModelDescriptor> {
        let resolved = match tokio::fs::canonicalize(path).await {
            Ok(resolved) => resolved,
            Err(_) => return Err(Error::PathNotFound(path.to_path_buf())),
        };
        match tokio::fs::metadata(&resolved).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => return Err(Error::PathNotFound(path.to_path_buf())),
        }
        let name = name
            .filter(|n| !n.trim().is_empty())
            .or_else(|| {
                resolved
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| resolved.display().to_string());

        self.load(ModelDescriptor::local_path(name, resolved)).await
    }

    /// Release the loaded pipeline, if any.
    pub async fn unload(&self) -> Result<()> {
        let _gate = self.try_gate()?;
        let previous = self.inner.pipeline.write().await.take();
        let last_error = self.inner.state.borrow().last_error.clone();
        self.publish(PipelinePhase::Unloaded, None, last_error);
        if let Some(previous) = previous {
            info!("Unloading model {}", previous.descriptor.name);
            release(previous).await;
        }
        Ok(())
    }

    /// Current phase, descriptor and directory. Never waits on a load.
    pub fn status(&self) -> LifecycleStatus {
        let state = self.inner.state.borrow().clone();
        LifecycleStatus {
            phase: state.phase,
            descriptor: state.descriptor,
            directory: self.directory(),
            last_error: state.last_error,
        }
    }

    /// The ready pipeline, or `NoModelLoaded`. The phase is checked again
    /// after the shared lock is taken since a load may have started meanwhile.
    pub(crate) async fn acquire_ready(&self) -> Result<ReadyPipeline> {
        if self.inner.state.borrow().phase != PipelinePhase::Ready {
            return Err(Error::NoModelLoaded);
        }
        let guard = self.inner.pipeline.clone().read_owned().await;
        OwnedRwLockReadGuard::try_map(guard, |slot| slot.as_ref()).map_err(|_| Error::NoModelLoaded)
    }

    /// Release the active pipeline after it failed while serving and report
    /// `Error`. Does nothing if a transition already replaced `descriptor`.
    pub(crate) async fn retire(&self, descriptor: ModelDescriptor, reason: String) {
        // Runs on its own task so a dropped request cannot strand the gate.
        let this = self.clone();
        let task = tokio::spawn(async move {
            let Ok(_gate) = this.try_gate() else {
                return;
            };
            let failed = {
                let mut slot = this.inner.pipeline.write().await;
                let current = slot
                    .as_ref()
                    .is_some_and(|active| active.descriptor == descriptor);
                if current {
                    slot.take()
                } else {
                    None
                }
            };
            if let Some(failed) = failed {
                warn!("Model {} stopped serving: {}", descriptor.name, reason);
                this.publish(PipelinePhase::Error, Some(descriptor), Some(reason));
                release(failed).await;
            }
        });
        if let Err(e) = task.await {
            warn!("Failed to retire pipeline: {}", e);
        }
    }

    fn try_gate(&self) -> Result<OwnedMutexGuard<()>> {
        self.inner
            .load_gate
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::Busy("another model is currently loading".to_string()))
    }

    fn publish(
        &self,
        phase: PipelinePhase,
        descriptor: Option<ModelDescriptor>,
        last_error: Option<String>,
    ) {
        self.inner.state.send_replace(PhaseState {
            phase,
            descriptor,
            last_error,
        });
    }

    async fn load(&self, descriptor: ModelDescriptor) -> Result<ModelDescriptor> {
        let gate = self.try_gate()?;

        // The transition runs on its own task so a dropped request cannot
        // leave the lifecycle stuck in `Loading`.
        let this = self.clone();
        tokio::spawn(async move { this.run_load(gate, descriptor).await })
            .await
            .map_err(|e| Error::Load(format!("load task failed: {}", e)))?
    }

    async fn run_load(
        &self,
        _gate: OwnedMutexGuard<()>,
        descriptor: ModelDescriptor,
    ) -> Result<ModelDescriptor> {
        let previous_error = self.inner.state.borrow().last_error.clone();
        self.publish(PipelinePhase::Loading, Some(descriptor.clone()), previous_error);

        // Waits for in-flight generations on the old handle to finish.
        let previous = self.inner.pipeline.write().await.take();
        if let Some(previous) = previous {
            info!("Releasing model {}", previous.descriptor.name);
            release(previous).await;
        }

        let spec = LoadSpec {
            model_path: descriptor.path.clone(),
            format: ModelFormat::from_path(&descriptor.path),
            device: self.inner.engine.device.clone(),
            dtype: self.inner.engine.dtype.clone(),
        };
        info!("Loading model {} from {:?}", descriptor.name, spec.model_path);

        let loader = self.inner.loader.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.load(&spec))
            .await
            .map_err(|e| Error::Load(e.to_string()))
            .and_then(|result| result);

        match loaded {
            Ok(handle) => {
                debug_assert_eq!(handle.artifact(), descriptor.path.as_path());
                let mut slot = self.inner.pipeline.write().await;
                *slot = Some(ActivePipeline {
                    descriptor: descriptor.clone(),
                    handle,
                });
                self.publish(PipelinePhase::Ready, Some(descriptor.clone()), None);
                info!("Model {} loaded successfully", descriptor.name);
                Ok(descriptor)
            }
            Err(err) => {
                let err = match err {
                    Error::Inference(msg) => Error::Load(msg),
                    other => other,
                };
                let message = err.to_string();
                warn!("Failed to load model {}: {}", descriptor.name, message);
                self.publish(PipelinePhase::Unloaded, None, Some(message));
                Err(err)
            }
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

/// Drop a pipeline off the async runtime; engines may block while shutting down.
async fn release(previous: ActivePipeline) {
    if let Err(e) = tokio::task::spawn_blocking(move || drop(previous)).await {
        warn!("Failed to release pipeline: {}", e);
    }
}
