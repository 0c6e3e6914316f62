use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::RegistryError;

/// Expected bearer token. `None` disables authentication.
#[derive(Clone, Default)]
pub struct ApiToken(pub Option<Arc<str>>);

impl ApiToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.map(Arc::from))
    }

    pub fn accepts(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.0 else {
            return true;
        };

        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let Some(token) = auth.strip_prefix("Bearer ") else {
            return false;
        };

        let token_bytes = token.as_bytes();
        let expected_bytes = expected.as_bytes();
        token_bytes.len() == expected_bytes.len()
            && token_bytes.ct_eq(expected_bytes).unwrap_u8() == 1
    }
}

pub async fn require_bearer(
    State(token): State<ApiToken>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, RegistryError> {
    if !token.accepts(req.headers()) {
        warn!(path = %req.uri().path(), "Rejected request with invalid bearer token");
        return Err(RegistryError::Unauthorized);
    }
    Ok(next.run(req).await)
}
