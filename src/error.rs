use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::models::ErrorOutput;

#[derive(Debug)]
pub enum AppError {
    FileNotFound(String),
    InvalidSetting { name: String, reason: String },
    InvalidUpload(String),
    Unauthorized,
    WrongPassword,
    StorageError(String),
    IoError(std::io::Error),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::FileNotFound(id) => write!(f, "File '{}' not found", id),
            AppError::InvalidSetting { name, reason } => {
                write!(f, "Invalid setting {}: {}", name, reason)
            }
            AppError::InvalidUpload(reason) => write!(f, "Invalid upload: {}", reason),
            AppError::Unauthorized => write!(f, "Unauthorized"),
            AppError::WrongPassword => write!(f, "Incorrect password"),
            AppError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            AppError::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::FileNotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidUpload(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::WrongPassword => StatusCode::FORBIDDEN,
            AppError::InvalidSetting { .. } | AppError::StorageError(_) | AppError::IoError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!("{}", self);
        }

        let body = serde_json::to_string(&ErrorOutput {
            result: "error",
            error_message: self.to_string(),
        })
        .unwrap_or_default();

        let mut response = (status, [("content-type", "application/json")], body).into_response();
        if let AppError::Unauthorized = self {
            response.headers_mut().insert(
                "www-authenticate",
                axum::http::HeaderValue::from_static("Basic realm=\"gokapi\""),
            );
        }
        response
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::IoError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(AppError::FileNotFound("abc".to_string()).to_string(), "File 'abc' not found");
        let err = AppError::InvalidSetting {
            name: "GOKAPI_PORT".to_string(),
            reason: "'x' is not a valid port".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid setting GOKAPI_PORT: 'x' is not a valid port");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::FileNotFound("a".to_string()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::InvalidUpload("no file".to_string()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        let response = AppError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("www-authenticate"));
    }
}
