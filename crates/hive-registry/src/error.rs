use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use hive_shared::types::{ChannelId, FileId, NodeId, UserId};
use hive_shared::ErrorKind;
use hive_store::StoreError;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("File not found: {0}")]
    FileNotFound(FileId),

    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("No eligible node available")]
    NoEligibleNode,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Missing or invalid bearer token")]
    Unauthorized,

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::NodeNotFound(_)
            | RegistryError::FileNotFound(_)
            | RegistryError::ChannelNotFound(_)
            | RegistryError::UserNotFound(_) => ErrorKind::NotFound,
            RegistryError::NoEligibleNode => ErrorKind::NodeUnavailable,
            RegistryError::BadRequest(_) => ErrorKind::Validation,
            RegistryError::Unauthorized => ErrorKind::AuthFailure,
            RegistryError::Store(_) | RegistryError::Internal(_) => ErrorKind::RegistryUnreachable,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            RegistryError::NodeNotFound(_)
            | RegistryError::FileNotFound(_)
            | RegistryError::ChannelNotFound(_)
            | RegistryError::UserNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            RegistryError::NoEligibleNode => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            RegistryError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            RegistryError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            RegistryError::Store(e) => {
                tracing::error!(error = %e, "Registry storage failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            RegistryError::Internal(e) => {
                tracing::error!(error = %e, "Registry internal failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
