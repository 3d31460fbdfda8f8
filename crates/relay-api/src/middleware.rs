//! Bearer-token auth for management endpoints, and the shutdown-refusal
//! gate in front of ingress.

use crate::AppState;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Outcome of checking a request's bearer token against the configured
/// management token.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthStatus {
    Authorized,
    MissingToken,
    InvalidToken,
    NotConfigured,
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let hash_a = Sha256::digest(a.as_bytes());
    let hash_b = Sha256::digest(b.as_bytes());
    hash_a.ct_eq(&hash_b).into()
}

fn check_bearer_auth(state: &AppState, header_value: Option<&str>) -> AuthStatus {
    let Some(expected) = state
        .config
        .server
        .as_ref()
        .and_then(|s| s.management_token.as_ref())
        .and_then(|t| t.resolve().ok())
    else {
        return AuthStatus::NotConfigured;
    };

    let Some(header_value) = header_value else {
        return AuthStatus::MissingToken;
    };

    let Some(token) = header_value.strip_prefix("Bearer ") else {
        return AuthStatus::InvalidToken;
    };

    if constant_time_eq(token, &expected) {
        AuthStatus::Authorized
    } else {
        AuthStatus::InvalidToken
    }
}

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let header_value = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match check_bearer_auth(&state, header_value) {
        AuthStatus::Authorized => next.run(req).await,
        AuthStatus::NotConfigured => {
            (StatusCode::SERVICE_UNAVAILABLE, "management API disabled").into_response()
        }
        AuthStatus::MissingToken | AuthStatus::InvalidToken => {
            (StatusCode::UNAUTHORIZED, "invalid or missing bearer token").into_response()
        }
    }
}

/// Refuses new ingress requests with `503` + `Retry-After` once a shutdown
/// signal has flipped [`AppState::shutting_down`]. Layered outside the
/// ingress router so it runs before signature verification or rate
/// limiting.
pub async fn shutdown_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if state.shutting_down.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "30")],
            "shutting down",
        )
            .into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("secret-token", "secret-token"));
    }

    #[test]
    fn constant_time_eq_rejects_different_strings() {
        assert!(!constant_time_eq("secret-token", "other-token"));
    }
}
