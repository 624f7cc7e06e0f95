//! Request authentication at the HTTP boundary.
//!
//! Session routes carry `X-Session-Token`; a middleware verifies it and
//! stashes the [`SessionContext`] in request extensions. Admin routes use
//! the [`AdminGuard`] extractor: the admin bearer token is read once at
//! startup, stored as a SHA-256 digest, and compared in constant time.

use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use amb_domain::error::Error;

use crate::api::error::ApiError;
use crate::state::AppState;

pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

/// Pull the session token out of the headers.
pub fn session_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(SESSION_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(ApiError(Error::Unauthorized))
}

/// Best-effort client address for rate limiting and audit records.
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Middleware for routes that act on an already-verified session (catalog,
/// connection management). The invoke and heartbeat paths verify tokens
/// themselves because verification is part of their contract.
pub async fn require_session(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = match req
        .headers()
        .get(SESSION_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(t) => t.to_owned(),
        None => return ApiError(Error::Unauthorized).into_response(),
    };
    let ip = client_ip(req.headers());

    match state.auth.authenticate(&token, &ip, Utc::now()).await {
        Ok(ctx) => {
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}

/// Axum extractor enforcing the admin bearer token.
///
/// With no admin token configured the admin surface is disabled outright;
/// there is no unauthenticated fallback on a credential-issuing service.
pub struct AdminGuard;

#[async_trait::async_trait]
impl FromRequestParts<AppState> for AdminGuard {
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let expected_hash = match &state.admin_token_hash {
            Some(h) => h,
            None => {
                return Err((
                    StatusCode::FORBIDDEN,
                    Json(serde_json::json!({
                        "error": "Forbidden",
                        "message": "Admin API is disabled",
                    })),
                ))
            }
        };

        let provided = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");

        // Hash the provided token to a fixed-length digest, then compare in
        // constant time. This avoids leaking the token length.
        let provided_hash = Sha256::digest(provided.as_bytes());
        if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "Unauthorized",
                    "message": "Authentication required",
                })),
            ));
        }
        Ok(AdminGuard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers), "10.1.2.3");
    }

    #[test]
    fn client_ip_falls_back_to_unknown() {
        assert_eq!(client_ip(&HeaderMap::new()), "unknown");
    }

    #[test]
    fn missing_token_is_rejected() {
        assert!(session_token(&HeaderMap::new()).is_err());
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_TOKEN_HEADER, "abc.def".parse().unwrap());
        assert_eq!(session_token(&headers).unwrap(), "abc.def");
    }
}
