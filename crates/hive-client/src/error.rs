use thiserror::Error;

use hive_shared::types::FileId;
use hive_shared::ErrorKind;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("No storage nodes available")]
    NoNodesAvailable,

    #[error("File not found: {0}")]
    FileNotFound(FileId),

    #[error("Node {node} unavailable: {reason}")]
    NodeUnavailable { node: String, reason: String },

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Registry unreachable: {0}")]
    Registry(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Upload of {file_id} reached none of {attempted} nodes")]
    UploadFailed { file_id: FileId, attempted: usize },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Realtime connection error: {0}")]
    Realtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::FileNotFound(_) => ErrorKind::NotFound,
            ClientError::AuthFailure(_) => ErrorKind::AuthFailure,
            ClientError::Registry(_) => ErrorKind::RegistryUnreachable,
            ClientError::Validation(_) | ClientError::Io(_) => ErrorKind::Validation,
            ClientError::NoNodesAvailable
            | ClientError::NodeUnavailable { .. }
            | ClientError::ChecksumMismatch { .. }
            | ClientError::UploadFailed { .. }
            | ClientError::RetriesExhausted { .. }
            | ClientError::Cancelled
            | ClientError::Realtime(_) => ErrorKind::NodeUnavailable,
        }
    }

    /// Map a non-success registry response onto the error taxonomy.
    pub(crate) fn from_registry_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {status}: {body}");
        match ErrorKind::from_status(status) {
            Some(ErrorKind::AuthFailure) => ClientError::AuthFailure(message),
            Some(ErrorKind::Validation) => ClientError::Validation(message),
            _ => ClientError::Registry(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_status_mapping() {
        assert_eq!(
            ClientError::from_registry_status(401, "").kind(),
            ErrorKind::AuthFailure
        );
        assert_eq!(
            ClientError::from_registry_status(400, "bad").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            ClientError::from_registry_status(503, "").kind(),
            ErrorKind::RegistryUnreachable
        );
    }
}
