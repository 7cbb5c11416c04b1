//! Application state shared by all handlers

use std::sync::Arc;

use sdserve_core::{GenerationCoordinator, ModelLifecycle, PipelineLoader, ServiceConfig};

/// Shared application state. Clones share the same lifecycle.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: ModelLifecycle,
    pub generator: GenerationCoordinator,
    /// Request timeout for generations (seconds)
    pub request_timeout_secs: u64,
}

impl AppState {
    pub fn new(
        config: &ServiceConfig,
        loader: Arc<dyn PipelineLoader>,
        request_timeout_secs: u64,
    ) -> sdserve_core::Result<Self> {
        let lifecycle = ModelLifecycle::new(config, loader)?;
        Ok(Self::from_lifecycle(lifecycle, request_timeout_secs))
    }

    pub fn from_lifecycle(lifecycle: ModelLifecycle, request_timeout_secs: u64) -> Self {
        Self {
            generator: GenerationCoordinator::new(lifecycle.clone()),
            lifecycle,
            request_timeout_secs,
        }
    }
}
