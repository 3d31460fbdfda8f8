//! Core domain types shared across the ingestion and sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four supported inbound providers. Each maps to its own ingress path
/// and signature scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Payments,
    Identity,
    SourceControl,
    Email,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Payments => "payments",
            Provider::Identity => "identity",
            Provider::SourceControl => "source_control",
            Provider::Email => "email",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of an ingested webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Received,
    Dispatched,
    Failed,
    Exhausted,
}

/// A verified, persisted webhook event, as stored in the event store.
///
/// `event_id` is the provider-supplied idempotency key; the `(provider,
/// event_id)` pair is unique at the storage layer. `payload` and `signature`
/// are immutable once inserted. `processed` transitions false→true exactly
/// once, the moment dispatch first succeeds; `processed_at` is set in the
/// same transition and never cleared afterward. `status` refines that
/// boolean with the operational detail (`received`/`failed`/`exhausted`)
/// an operator inspecting a stuck event needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    pub provider: Provider,
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub signature: String,
    pub received_at: DateTime<Utc>,
    pub status: EventStatus,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

/// A structured record synchronized with a source-control repository.
///
/// `data` is restricted to JSON object values by construction, which is also
/// why it can never contain a reference cycle: a `serde_json::Value` tree has
/// no backreferences, so the "refuse on cycle" concern the spec raises for a
/// general attribute tree does not apply to this representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub namespace: String,
    pub id: String,
    pub record_type: String,
    pub data: serde_json::Value,
    pub content: String,
    pub repository: Option<String>,
    pub path: Option<String>,
    pub branch: Option<String>,
    pub last_synced_hash: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
}

impl Record {
    /// A record is sync-eligible once it names a repository, path, and
    /// branch; an absent triple means "unsynced" per the data model.
    pub fn sync_target(&self) -> Option<(&str, &str, &str)> {
        match (&self.repository, &self.path, &self.branch) {
            (Some(r), Some(p), Some(b)) => Some((r, p, b)),
            _ => None,
        }
    }
}

/// Sync status of a record relative to its external file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Unsynced,
    Synced,
    Dirty,
    Conflict,
}

/// Strategy used (or to be used) to resolve a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    Ours,
    Theirs,
    Merge,
    Manual,
}

/// Status of a recorded conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Failed,
}

/// A conflict detected when a record's externally-observed content hash has
/// moved away from the hash the local side believed it had, i.e. the remote
/// side changed (and possibly the local side changed too) since the last
/// successful sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub namespace: String,
    pub record_id: String,
    pub repository: String,
    pub path: String,
    pub branch: String,
    pub expected_hash: String,
    pub observed_hash: String,
    pub local_content: String,
    pub remote_content: String,
    pub created_at: DateTime<Utc>,
    pub status: ConflictStatus,
    pub strategy: Option<ResolutionStrategy>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
