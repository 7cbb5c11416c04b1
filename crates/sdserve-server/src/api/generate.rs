//! Image generation endpoint

use std::time::Duration;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, Response, StatusCode},
    Json,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;
use sdserve_core::GenerationParams;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Raw `image/png` body
    #[default]
    Png,
    /// JSON with the PNG base64-encoded
    B64Json,
}

/// Generation request
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: String,

    #[serde(flatten)]
    pub params: GenerationParams,

    #[serde(default)]
    pub response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
pub struct GenerateJsonResponse {
    /// Base64-encoded PNG
    pub image: String,
    pub model: String,
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub generation_time_ms: f64,
}

/// Generate an image with the loaded model
pub async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response<Body>, ApiError> {
    let Json(req) = payload?;
    info!("Generate request: {} chars", req.prompt.len());

    let timeout = Duration::from_secs(state.request_timeout_secs);
    let image = tokio::time::timeout(timeout, state.generator.generate(&req.prompt, req.params))
        .await
        .map_err(|_| ApiError::timeout("Request timeout"))??;

    let response = match req.response_format {
        ResponseFormat::Png => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "image/png")
            .header(header::CONTENT_LENGTH, image.png.len())
            .body(Body::from(image.png)),
        ResponseFormat::B64Json => {
            let body = GenerateJsonResponse {
                image: base64::engine::general_purpose::STANDARD.encode(&image.png),
                model: image.model,
                prompt: req.prompt,
                width: image.width,
                height: image.height,
                generation_time_ms: image.generation_time_ms,
            };
            let json = serde_json::to_vec(&body)
                .map_err(|e| ApiError::bad_request(format!("Failed to encode response: {}", e)))?;
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json))
        }
    };

    response.map_err(|e| ApiError::bad_request(format!("Failed to build response: {}", e)))
}
