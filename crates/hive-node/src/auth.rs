use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::NodeError;

/// Bearer token callers must present. `None` disables authentication.
#[derive(Clone, Default)]
pub struct NodeToken(Option<Arc<str>>);

impl NodeToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.map(Arc::from))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    /// Compare a presented token in constant time.
    pub fn accepts(&self, presented: Option<&str>) -> bool {
        let Some(expected) = &self.0 else {
            return true;
        };
        let Some(token) = presented else {
            return false;
        };
        let (a, b) = (token.as_bytes(), expected.as_bytes());
        a.len() == b.len() && a.ct_eq(b).unwrap_u8() == 1
    }
}

/// Token carried by an `Authorization: Bearer ...` header.
pub fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

pub async fn require_bearer(
    State(token): State<NodeToken>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, NodeError> {
    if !token.accepts(bearer(req.headers())) {
        warn!(path = %req.uri().path(), "Rejected request with invalid bearer token");
        return Err(NodeError::Unauthorized);
    }
    Ok(next.run(req).await)
}
