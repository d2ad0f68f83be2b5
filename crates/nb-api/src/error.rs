use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nb_core::{BlockerError, TargetError, TargetState};
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    /// Request names an invalid port, address, interface or action
    BadRequest(String),
    /// Rule engine failed; `state` tells the caller whether the target opened
    Engine {
        message: String,
        state: Option<TargetState>,
    },
    /// Blocking worker died before answering
    Internal(String),
}

impl From<TargetError> for ApiError {
    fn from(err: TargetError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<BlockerError> for ApiError {
    fn from(err: BlockerError) -> Self {
        ApiError::Engine {
            state: err.target_state(),
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("worker failed: {}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Engine {
                message,
                state: Some(state),
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": message, "state": state })),
            )
                .into_response(),
            ApiError::Engine {
                message,
                state: None,
            }
            | ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": message })),
            )
                .into_response(),
        }
    }
}
