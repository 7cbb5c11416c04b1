//! Model directory, download and load endpoints

use std::path::PathBuf;

use axum::{extract::rejection::JsonRejection, extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;
use sdserve_core::{DirectorySource, PipelinePhase, Provenance};

fn required(value: Option<String>, message: &str) -> Result<String, ApiError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request(message))
}

/// Response for `GET /models`
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<String>,
    pub current: Option<String>,
    pub model_dir: PathBuf,
    pub current_model_path: Option<PathBuf>,
}

/// List artifacts in the active directory and the loaded model
pub async fn list_models(State(state): State<AppState>) -> Result<Json<ModelsResponse>, ApiError> {
    let models = state.lifecycle.list_models().await?;
    let status = state.lifecycle.status();
    let current = status
        .descriptor
        .filter(|_| status.phase == PipelinePhase::Ready);

    Ok(Json(ModelsResponse {
        models,
        current: current.as_ref().map(|d| d.name.clone()),
        model_dir: status.directory.path,
        current_model_path: current.map(|d| d.path),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SetModelDirRequest {
    #[serde(default)]
    pub directory: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SetModelDirResponse {
    pub status: &'static str,
    pub model_dir: PathBuf,
    pub message: String,
}

/// Change the active model directory, creating it if needed
pub async fn set_model_dir(
    State(state): State<AppState>,
    payload: Result<Json<SetModelDirRequest>, JsonRejection>,
) -> Result<Json<SetModelDirResponse>, ApiError> {
    let Json(req) = payload?;
    let directory = required(req.directory, "No directory provided")?;

    let updated = state.lifecycle.set_directory(PathBuf::from(directory)).await?;
    Ok(Json(SetModelDirResponse {
        status: "updated",
        message: format!("Model directory updated to {}", updated.path.display()),
        model_dir: updated.path,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    /// Download here instead of the active directory
    #[serde(default)]
    pub directory: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub status: &'static str,
    pub path: PathBuf,
    pub directory: PathBuf,
    /// True when the file already existed and nothing was transferred
    pub cached: bool,
}

/// Download an artifact by URL
pub async fn download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let Json(req) = payload?;
    let (url, filename) = match (req.url, req.filename) {
        (Some(url), Some(filename)) if !url.is_empty() && !filename.is_empty() => (url, filename),
        _ => return Err(ApiError::bad_request("Missing url or filename")),
    };
    let directory = req.directory.filter(|d| !d.trim().is_empty()).map(PathBuf::from);

    info!("Download request: {} -> {}", url, filename);
    let (outcome, directory) = state.lifecycle.fetch(&url, &filename, directory).await?;

    Ok(Json(DownloadResponse {
        status: "downloaded",
        path: outcome.path,
        directory,
        cached: !outcome.transferred,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoadResponse {
    pub status: &'static str,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Load a model from the active directory
pub async fn select(
    State(state): State<AppState>,
    payload: Result<Json<SelectRequest>, JsonRejection>,
) -> Result<Json<LoadResponse>, ApiError> {
    let Json(req) = payload?;
    let model = required(req.model, "No model provided")?;
    info!("Selecting model: {}", model);

    let descriptor = state.lifecycle.select_model(&model).await?;
    Ok(Json(LoadResponse {
        status: "loaded",
        model: descriptor.name,
        path: None,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LoadFromPathRequest {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Load a model from an arbitrary file path
pub async fn load_from_path(
    State(state): State<AppState>,
    payload: Result<Json<LoadFromPathRequest>, JsonRejection>,
) -> Result<Json<LoadResponse>, ApiError> {
    let Json(req) = payload?;
    let path = required(req.path, "No model path provided")?;
    info!("Loading model from path: {}", path);

    let descriptor = state
        .lifecycle
        .load_from_path(&PathBuf::from(&path), req.name)
        .await?;
    Ok(Json(LoadResponse {
        status: "loaded",
        model: descriptor.name,
        path: Some(PathBuf::from(path)),
    }))
}

#[derive(Debug, Serialize)]
pub struct UnloadResponse {
    pub status: &'static str,
}

/// Release the loaded model
pub async fn unload(State(state): State<AppState>) -> Result<Json<UnloadResponse>, ApiError> {
    state.lifecycle.unload().await?;
    Ok(Json(UnloadResponse { status: "unloaded" }))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub phase: PipelinePhase,
    pub model: Option<String>,
    pub model_path: Option<PathBuf>,
    pub provenance: Option<Provenance>,
    pub model_dir: PathBuf,
    pub model_dir_source: DirectorySource,
    pub last_error: Option<String>,
}

/// Lifecycle snapshot; answers immediately even while a model is loading
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let status = state.lifecycle.status();
    let (model, model_path, provenance) = match status.descriptor {
        Some(d) => (Some(d.name), Some(d.path), Some(d.provenance)),
        None => (None, None, None),
    };

    Json(StatusResponse {
        phase: status.phase,
        model,
        model_path,
        provenance,
        model_dir: status.directory.path,
        model_dir_source: status.directory.source,
        last_error: status.last_error,
    })
}
