//! API routes and handlers

mod generate;
mod health;
mod models;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/status", get(models::status))
        // Model management
        .route("/models", get(models::list_models))
        .route("/set_model_dir", post(models::set_model_dir))
        .route("/download", post(models::download))
        .route("/select", post(models::select))
        .route("/load_from_path", post(models::load_from_path))
        .route("/unload", post(models::unload))
        // Inference
        .route("/generate", post(generate::generate))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
