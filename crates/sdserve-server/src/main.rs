//! sdserve - HTTP API for local Stable Diffusion model management

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod state;

use sdserve_core::{
    DirectoryChangePolicy, EngineConfig, ServiceConfig, WorkerLoader, MODEL_DIR_ENV,
};
use state::AppState;

/// Local model management and image generation server
#[derive(Debug, Parser)]
#[command(name = "sdserve", version, about)]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0", env = "SD_HOST")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "5000", env = "SD_PORT")]
    port: u16,

    /// Models directory (overrides the environment and platform default)
    #[arg(short, long, value_name = "PATH")]
    models_dir: Option<PathBuf>,

    /// Engine worker executable
    #[arg(long, env = "SD_ENGINE_CMD")]
    engine_cmd: Option<String>,

    /// Extra arguments for the engine worker
    #[arg(long = "engine-arg", value_name = "ARG", allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// Device the engine loads onto
    #[arg(long, default_value = "cuda", env = "SD_ENGINE_DEVICE")]
    device: String,

    /// Numeric precision for weights
    #[arg(long, default_value = "float16", env = "SD_ENGINE_DTYPE")]
    dtype: String,

    /// Generation timeout in seconds; a worker silent for this long is stopped
    #[arg(long, default_value = "300", env = "REQUEST_TIMEOUT_SECS")]
    request_timeout: u64,

    /// Download timeout in seconds
    #[arg(long, default_value = "3600")]
    download_timeout: u64,

    /// Refuse directory changes while a model is loading
    #[arg(long)]
    reject_dir_change_while_loading: bool,

    /// Artifact extensions listed by /models
    #[arg(long = "model-extension", value_name = "EXT", default_value = "safetensors")]
    model_extensions: Vec<String>,
}

impl Args {
    fn service_config(&self) -> ServiceConfig {
        let defaults = EngineConfig::default();
        ServiceConfig {
            models_dir: self.models_dir.clone(),
            engine: EngineConfig {
                command: self.engine_cmd.clone(),
                args: self.engine_args.clone(),
                device: self.device.clone(),
                dtype: self.dtype.clone(),
                generate_timeout_secs: self.request_timeout,
                ..defaults
            },
            download_timeout_secs: self.download_timeout,
            directory_change_policy: if self.reject_dir_change_while_loading {
                DirectoryChangePolicy::RejectWhileLoading
            } else {
                DirectoryChangePolicy::ApplyToSubsequent
            },
            model_extensions: self.model_extensions.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sdserve_server=debug,sdserve_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting sdserve");

    let config = args.service_config();
    if config.engine.command.is_none() {
        warn!("SD_ENGINE_CMD is not set; model loads will fail until an engine is configured");
    }
    if let Ok(dir) = std::env::var(MODEL_DIR_ENV) {
        info!("{} = {}", MODEL_DIR_ENV, dir);
    }

    let loader = Arc::new(WorkerLoader::new(&config.engine));
    let state = AppState::new(&config, loader, args.request_timeout)?;
    info!("Model lifecycle initialized");

    let app = api::create_router(state.clone());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    info!("Server ready. Press Ctrl+C to stop.");
    server.await?;

    if let Err(e) = state.lifecycle.unload().await {
        warn!("Failed to unload model on shutdown: {}", e);
    }
    info!("Shutdown complete");

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}
