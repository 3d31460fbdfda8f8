//! HTTP handlers: per-provider webhook ingress and management endpoints.

pub mod ingress;
pub mod management;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Liveness probe, unauthenticated.
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Render an error as `{error: <message>}` under its mapped status code.
pub fn error_response(error: &relay_core::Error) -> Response {
    (error_status(error), Json(serde_json::json!({ "error": error.to_string() }))).into_response()
}

/// Maps a [`relay_core::Error`] to the HTTP status the ingress/management
/// surface reports it under.
pub fn error_status(error: &relay_core::Error) -> StatusCode {
    use relay_core::Error::*;
    match error {
        MalformedHeader(_) | MalformedBody(_) => StatusCode::BAD_REQUEST,
        InvalidSignature => StatusCode::UNAUTHORIZED,
        ReplayTooOld => StatusCode::UNAUTHORIZED,
        ProviderDisabled(_) => StatusCode::NOT_FOUND,
        Duplicate { .. } => StatusCode::OK,
        EventNotFound { .. } | RecordNotFound { .. } | ConflictNotFound(_) => StatusCode::NOT_FOUND,
        NotImplemented(_) => StatusCode::UNPROCESSABLE_ENTITY,
        HandlerFailed(_) | HandlerTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ScmApi(_) => StatusCode::BAD_GATEWAY,
        ScmHashMismatch { .. } => StatusCode::CONFLICT,
        FrontmatterParse(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
