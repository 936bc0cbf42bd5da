use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// The transcoder binary could not be launched (missing, not executable)
    #[error("Failed to spawn muxer for {camera} ({binary}): {reason}")]
    Spawn {
        camera: String,
        binary: String,
        reason: String,
    },

    /// A viewer listener could not be bound
    #[error("Listener for {camera} on {addr} failed: {reason}")]
    ListenerBind {
        camera: String,
        addr: String,
        reason: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        tracing::error!(
            error_type = std::any::type_name_of_val(&self),
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::NotFound("cam".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Config("bad".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_spawn_error_message() {
        let err = AppError::Spawn {
            camera: "front-door".into(),
            binary: "/usr/bin/ffmpeg".into(),
            reason: "No such file or directory".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("front-door"));
        assert!(msg.contains("/usr/bin/ffmpeg"));
    }
}
