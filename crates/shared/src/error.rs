use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    /// Maps a non-success HTTP status onto the error code set.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            400 | 422 => Self::Validation,
            429 => Self::RateLimited,
            _ => Self::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::from_status(status), message)
    }

    /// Text suitable for an inline error next to a failed action.
    pub fn user_message(&self) -> String {
        match self.code {
            ErrorCode::Unauthorized => "Authentication failed. Please login again.".to_string(),
            ErrorCode::Forbidden => {
                "You do not have permission to send messages to this project.".to_string()
            }
            ErrorCode::NotFound => "Project not found.".to_string(),
            ErrorCode::Validation => format!("The server rejected the message: {}", self.message),
            ErrorCode::RateLimited => {
                "Too many messages. Please wait a moment before sending again.".to_string()
            }
            ErrorCode::Internal => "A server error occurred. Please try again.".to_string(),
        }
    }
}

/// Error body returned by the REST API on non-success statuses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
}
