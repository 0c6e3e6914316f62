use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use hive_shared::types::{ChannelId, FileId};
use hive_shared::{ErrorKind, HiveError};
use hive_store::StoreError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("File not found: {0}")]
    FileNotFound(FileId),

    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("File too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Insufficient storage: {needed} bytes needed, {available} available")]
    StorageFull { needed: u64, available: u64 },

    #[error("File storage error: {0}")]
    Storage(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Missing or invalid bearer token")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Node overloaded: {0}")]
    Overloaded(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::FileNotFound(_) | NodeError::ChannelNotFound(_) => ErrorKind::NotFound,
            NodeError::FileTooLarge { .. } | NodeError::BadRequest(_) => ErrorKind::Validation,
            NodeError::Unauthorized | NodeError::Forbidden(_) => ErrorKind::AuthFailure,
            NodeError::Registry(_) => ErrorKind::RegistryUnreachable,
            NodeError::StorageFull { .. }
            | NodeError::Overloaded(_)
            | NodeError::Storage(_)
            | NodeError::Store(_)
            | NodeError::Internal(_) => ErrorKind::NodeUnavailable,
        }
    }
}

impl From<HiveError> for NodeError {
    fn from(e: HiveError) -> Self {
        NodeError::BadRequest(e.to_string())
    }
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            NodeError::FileNotFound(_) | NodeError::ChannelNotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            NodeError::FileTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            NodeError::StorageFull { .. } => (StatusCode::INSUFFICIENT_STORAGE, self.to_string()),
            NodeError::Storage(e) => {
                tracing::error!(error = %e, "File storage failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "File storage error".to_string())
            }
            NodeError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            NodeError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            NodeError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            NodeError::Overloaded(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            NodeError::Registry(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            NodeError::Store(e) => {
                tracing::error!(error = %e, "Local store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            NodeError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_classify_back_to_kind() {
        let cases = [
            NodeError::FileNotFound(FileId::new()),
            NodeError::FileTooLarge { size: 2, max: 1 },
            NodeError::StorageFull {
                needed: 2,
                available: 1,
            },
            NodeError::Unauthorized,
            NodeError::Overloaded("busy".into()),
        ];
        for err in cases {
            let kind = err.kind();
            let status = err.into_response().status().as_u16();
            assert_eq!(ErrorKind::from_status(status), Some(kind), "status {status}");
        }
    }
}
