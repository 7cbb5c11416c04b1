//! API error handling

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// API error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            message: msg.into(),
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            kind: "timeout",
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "kind": self.kind,
        }));
        (self.status, body).into_response()
    }
}

impl From<sdserve_core::Error> for ApiError {
    fn from(err: sdserve_core::Error) -> Self {
        use sdserve_core::Error;

        let status = match &err {
            Error::Busy(_) => StatusCode::CONFLICT,
            Error::Fetch(_) | Error::Inference(_) | Error::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::Configuration(_)
            | Error::ModelNotFound { .. }
            | Error::PathNotFound(_)
            | Error::Load(_)
            | Error::NoModelLoaded
            | Error::InvalidPrompt
            | Error::InvalidParams(_)
            | Error::InvalidArtifactName(_) => StatusCode::BAD_REQUEST,
        };

        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}
