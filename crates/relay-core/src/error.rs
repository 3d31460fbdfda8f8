//! Error types for relay-core

use std::path::PathBuf;
use thiserror::Error;

/// Result type for relay-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for relay-core
#[derive(Debug, Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config not found. Searched: {searched:?}")]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A signature was structurally malformed (missing fields, bad hex/base64).
    #[error("Malformed signature header: {0}")]
    MalformedHeader(String),

    /// The raw body could not be parsed into the shape the verifier needs.
    #[error("Malformed event body: {0}")]
    MalformedBody(String),

    /// HMAC comparison failed.
    #[error("Invalid signature")]
    InvalidSignature,

    /// The signed timestamp is outside the replay tolerance window.
    #[error("Event timestamp outside replay tolerance")]
    ReplayTooOld,

    /// A provider is referenced with no configured HMAC key.
    #[error("Provider '{0}' is not configured (empty or missing secret)")]
    ProviderDisabled(String),

    #[error("Duplicate event: {provider}/{event_id}")]
    Duplicate { provider: String, event_id: String },

    #[error("Event not found: {provider}/{event_id}")]
    EventNotFound { provider: String, event_id: String },

    #[error("Record not found: {namespace}/{id}")]
    RecordNotFound { namespace: String, id: String },

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Conflict resolution strategy not implemented: {0}")]
    NotImplemented(String),

    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Handler timed out after {0:?}")]
    HandlerTimeout(std::time::Duration),

    #[error("Source-control API error: {0}")]
    ScmApi(String),

    #[error("Source-control hash mismatch: expected {expected}, observed {observed}")]
    ScmHashMismatch { expected: String, observed: String },

    #[error("Frontmatter parse error: {0}")]
    FrontmatterParse(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable error-kind tag for logging and metrics, independent of the
    /// Display message (which may change wording over time).
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MalformedHeader(_) => "malformed_header",
            Error::MalformedBody(_) => "malformed_body",
            Error::InvalidSignature => "invalid_signature",
            Error::ReplayTooOld => "replay_too_old",
            Error::ProviderDisabled(_) => "provider_disabled",
            Error::Duplicate { .. } => "duplicate_event",
            Error::HandlerFailed(_) => "handler_failed",
            Error::HandlerTimeout(_) => "handler_timeout",
            Error::ScmHashMismatch { .. } => "sync_conflict",
            Error::ScmApi(_) => "sync_external_unavailable",
            Error::NotImplemented(_) => "conflict_resolve_not_implemented",
            _ => "internal_error",
        }
    }
}
