use thiserror::Error;

/// Failure classes shared by every Hive component.
///
/// Retry and failover logic branches on the kind, never on error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    /// Network failure or 5xx from a storage node.
    NodeUnavailable,
    AuthFailure,
    /// Non-fatal: a file has fewer healthy copies than required.
    ReplicationDeficit,
    /// Transient: callers retry later.
    RegistryUnreachable,
    Validation,
}

impl ErrorKind {
    /// Classify an HTTP status returned by a node or the registry.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            404 => Some(ErrorKind::NotFound),
            401 | 403 => Some(ErrorKind::AuthFailure),
            500 | 502 | 503 | 504 | 507 => Some(ErrorKind::NodeUnavailable),
            400 | 409 | 413 | 422 => Some(ErrorKind::Validation),
            _ => None,
        }
    }

    /// Whether a fresh node assignment may make the call succeed.
    pub fn warrants_reassignment(&self) -> bool {
        matches!(self, ErrorKind::NodeUnavailable | ErrorKind::AuthFailure)
    }
}

#[derive(Error, Debug)]
pub enum HiveError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HiveError::NotFound(_) => ErrorKind::NotFound,
            HiveError::Validation(_) | HiveError::Serialization(_) => ErrorKind::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ErrorKind::from_status(404), Some(ErrorKind::NotFound));
        assert_eq!(ErrorKind::from_status(401), Some(ErrorKind::AuthFailure));
        for status in [500, 502, 503, 504] {
            assert_eq!(ErrorKind::from_status(status), Some(ErrorKind::NodeUnavailable));
        }
        assert_eq!(ErrorKind::from_status(200), None);
    }

    #[test]
    fn test_reassignment_classes() {
        assert!(ErrorKind::NodeUnavailable.warrants_reassignment());
        assert!(ErrorKind::AuthFailure.warrants_reassignment());
        assert!(!ErrorKind::NotFound.warrants_reassignment());
    }
}
