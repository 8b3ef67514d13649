//! Bearer-token authentication for the admin API.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Shared state for authentication
#[derive(Clone)]
pub struct AuthState {
    token: Arc<String>,
}

impl AuthState {
    pub fn new(token: String) -> Self {
        Self {
            token: Arc::new(token),
        }
    }

    /// Exact match on the full `Bearer <token>` header value. An empty
    /// configured token matches nothing.
    pub fn validate(&self, header_value: &str) -> bool {
        !self.token.is_empty() && header_value == format!("Bearer {}", self.token)
    }
}

/// Reject requests that do not carry the admin bearer token.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|h| auth.validate(h))
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exact_bearer_value() {
        let auth = AuthState::new("secret123".to_string());
        assert!(auth.validate("Bearer secret123"));
    }

    #[test]
    fn rejects_wrong_or_misshapen_values() {
        let auth = AuthState::new("secret123".to_string());
        assert!(!auth.validate("Bearer wrong"));
        assert!(!auth.validate("secret123"));
        assert!(!auth.validate("bearer secret123"));
        assert!(!auth.validate("Bearer secret123 "));
        assert!(!auth.validate(""));
    }

    #[test]
    fn empty_token_matches_nothing() {
        let auth = AuthState::new(String::new());
        assert!(!auth.validate("Bearer "));
        assert!(!auth.validate(""));
    }
}
