use std::time::Duration;

use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("missing credential: a signed-in session is required for real-time chat")]
    MissingCredential,
    #[error("missing room id: select a project before connecting")]
    MissingRoom,
    #[error("invalid websocket url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("real-time connection is not connected")]
    NotConnected,
    #[error("cannot encode outbound frame: {0}")]
    Encode(String),
    #[error("real-time connection was shut down")]
    ShutDown,
}

impl TransportError {
    /// Errors the caller must fix before connecting can succeed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential | Self::MissingRoom | Self::InvalidUrl { .. }
        )
    }
}

/// Failure of a durable read or write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("cannot reach the server: {0}")]
    Network(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("server rejected the request: {0}")]
    Rejected(#[from] ApiError),
    #[error("invalid response from server: {0}")]
    InvalidResponse(String),
}

impl RequestError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rejected(err) => Some(err.code),
            _ => None,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Network(_) | Self::Timeout(_) => {
                "Cannot connect to the server. Ensure the backend is running.".to_string()
            }
            Self::Rejected(err) => err.user_message(),
            Self::InvalidResponse(_) => "A server error occurred. Please try again.".to_string(),
        }
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("message cannot be empty")]
    EmptyContent,
    #[error("failed to send message: {0}")]
    Request(#[from] RequestError),
}

impl SendError {
    pub fn user_message(&self) -> String {
        match self {
            Self::EmptyContent => "Message cannot be empty.".to_string(),
            Self::Request(err) => err.user_message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to load messages: {0}")]
    Load(#[from] RequestError),
}
