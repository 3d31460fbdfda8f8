//! Durable, idempotent storage for ingested webhook events.

use crate::error::{Error, Result};
use crate::types::{EventStatus, Provider, WebhookEvent};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Open (creating if necessary) the sqlite database at `database_url` and
/// run migrations, mirroring the teacher's connect-and-migrate startup path.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| Error::Config(format!("invalid database url: {e}")))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA journal_mode = WAL").execute(pool).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS webhook_events (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            event_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            signature TEXT NOT NULL,
            received_at TEXT NOT NULL,
            status TEXT NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0,
            processed_at TEXT,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            UNIQUE(provider, event_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_webhook_events_status ON webhook_events(status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    provider: String,
    event_id: String,
    event_type: String,
    payload: String,
    signature: String,
    received_at: String,
    status: String,
    processed: i64,
    processed_at: Option<String>,
    attempt_count: i64,
    last_error: Option<String>,
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Database(sqlx::Error::Decode(Box::new(e))))
}

impl TryFrom<EventRow> for WebhookEvent {
    type Error = Error;

    fn try_from(row: EventRow) -> Result<Self> {
        let provider = parse_provider(&row.provider)?;
        let status = parse_status(&row.status)?;
        let payload: serde_json::Value = serde_json::from_str(&row.payload)?;
        let received_at = parse_rfc3339(&row.received_at)?;
        let processed_at = row.processed_at.as_deref().map(parse_rfc3339).transpose()?;

        Ok(WebhookEvent {
            id: row.id,
            provider,
            event_id: row.event_id,
            event_type: row.event_type,
            payload,
            signature: row.signature,
            received_at,
            status,
            processed: row.processed != 0,
            processed_at,
            attempt_count: row.attempt_count as u32,
            last_error: row.last_error,
        })
    }
}

fn parse_provider(s: &str) -> Result<Provider> {
    match s {
        "payments" => Ok(Provider::Payments),
        "identity" => Ok(Provider::Identity),
        "source_control" => Ok(Provider::SourceControl),
        "email" => Ok(Provider::Email),
        other => Err(Error::Config(format!("unknown provider in storage: {other}"))),
    }
}

fn parse_status(s: &str) -> Result<EventStatus> {
    match s {
        "received" => Ok(EventStatus::Received),
        "dispatched" => Ok(EventStatus::Dispatched),
        "failed" => Ok(EventStatus::Failed),
        "exhausted" => Ok(EventStatus::Exhausted),
        other => Err(Error::Config(format!("unknown status in storage: {other}"))),
    }
}

/// Insert a newly verified event. Returns [`Error::Duplicate`] if an event
/// with the same `(provider, event_id)` already exists, enforced by the
/// storage layer's unique constraint rather than a read-then-write check.
pub async fn insert_event(pool: &SqlitePool, event: &WebhookEvent) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO webhook_events
            (id, provider, event_id, event_type, payload, signature, received_at, status, processed, processed_at, attempt_count, last_error)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.id)
    .bind(event.provider.as_str())
    .bind(&event.event_id)
    .bind(&event.event_type)
    .bind(event.payload.to_string())
    .bind(&event.signature)
    .bind(event.received_at.to_rfc3339())
    .bind(status_str(event.status))
    .bind(event.processed as i64)
    .bind(event.processed_at.map(|dt| dt.to_rfc3339()))
    .bind(event.attempt_count as i64)
    .bind(&event.last_error)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(Error::Duplicate {
                provider: event.provider.to_string(),
                event_id: event.event_id.clone(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn status_str(status: EventStatus) -> &'static str {
    match status {
        EventStatus::Received => "received",
        EventStatus::Dispatched => "dispatched",
        EventStatus::Failed => "failed",
        EventStatus::Exhausted => "exhausted",
    }
}

/// Update an event's status, attempt count and last error after a dispatch
/// attempt. `processed`/`processed_at` transition false→true exactly once,
/// at the moment `status` first becomes `Dispatched`.
pub async fn update_event_status(
    pool: &SqlitePool,
    id: &str,
    status: EventStatus,
    attempt_count: u32,
    last_error: Option<&str>,
) -> Result<()> {
    let processed = status == EventStatus::Dispatched;
    let processed_at = processed.then(Utc::now);

    sqlx::query(
        "UPDATE webhook_events SET status = ?, processed = ?, processed_at = ?, attempt_count = ?, last_error = ? WHERE id = ?",
    )
    .bind(status_str(status))
    .bind(processed as i64)
    .bind(processed_at.map(|dt| dt.to_rfc3339()))
    .bind(attempt_count as i64)
    .bind(last_error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch a single event by its internal id.
pub async fn get_event(pool: &SqlitePool, id: &str) -> Result<WebhookEvent> {
    let row = sqlx::query_as::<_, EventRow>("SELECT * FROM webhook_events WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => WebhookEvent::try_from(row),
        None => Err(Error::EventNotFound {
            provider: "unknown".to_string(),
            event_id: id.to_string(),
        }),
    }
}

/// Fetch a single event by its externally-visible `(provider, eventId)` key,
/// the identifier management endpoints and retries are addressed by.
pub async fn get_event_by_provider_and_event_id(
    pool: &SqlitePool,
    provider: Provider,
    event_id: &str,
) -> Result<WebhookEvent> {
    let row = sqlx::query_as::<_, EventRow>(
        "SELECT * FROM webhook_events WHERE provider = ? AND event_id = ?",
    )
    .bind(provider.as_str())
    .bind(event_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => WebhookEvent::try_from(row),
        None => Err(Error::EventNotFound {
            provider: provider.to_string(),
            event_id: event_id.to_string(),
        }),
    }
}

/// List events with optional filtering by provider, status, and the
/// `processed` flag (the spec's external query contract filters on
/// `processed`; `status` additionally lets operational tooling narrow to a
/// specific non-processed state), newest first.
pub async fn list_events(
    pool: &SqlitePool,
    provider: Option<Provider>,
    status: Option<EventStatus>,
    processed: Option<bool>,
    limit: i64,
) -> Result<Vec<WebhookEvent>> {
    let mut query = String::from("SELECT * FROM webhook_events WHERE 1=1");
    if provider.is_some() {
        query.push_str(" AND provider = ?");
    }
    if status.is_some() {
        query.push_str(" AND status = ?");
    }
    if processed.is_some() {
        query.push_str(" AND processed = ?");
    }
    query.push_str(" ORDER BY received_at DESC LIMIT ?");

    let mut q = sqlx::query_as::<_, EventRow>(&query);
    if let Some(p) = provider {
        q = q.bind(p.as_str());
    }
    if let Some(s) = status {
        q = q.bind(status_str(s));
    }
    if let Some(p) = processed {
        q = q.bind(p as i64);
    }
    q = q.bind(limit);

    let rows = q.fetch_all(pool).await?;
    rows.into_iter().map(WebhookEvent::try_from).collect()
}

/// Events eligible for a retry pass: `failed` status with attempts remaining.
pub async fn list_retryable(
    pool: &SqlitePool,
    max_attempts: u32,
) -> Result<Vec<WebhookEvent>> {
    let rows = sqlx::query_as::<_, EventRow>(
        "SELECT * FROM webhook_events WHERE status = 'failed' AND attempt_count < ? ORDER BY received_at ASC",
    )
    .bind(max_attempts as i64)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(WebhookEvent::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provider;

    async fn test_pool() -> SqlitePool {
        connect("sqlite::memory:").await.unwrap()
    }

    fn sample_event(provider: Provider, event_id: &str) -> WebhookEvent {
        WebhookEvent {
            id: uuid::Uuid::new_v4().to_string(),
            provider,
            event_id: event_id.to_string(),
            event_type: "test.event".to_string(),
            payload: serde_json::json!({"hello": "world"}),
            signature: "t=1,v1=deadbeef".to_string(),
            received_at: Utc::now(),
            status: EventStatus::Received,
            processed: false,
            processed_at: None,
            attempt_count: 0,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrips() {
        let pool = test_pool().await;
        let event = sample_event(Provider::Payments, "evt_1");
        insert_event(&pool, &event).await.unwrap();

        let fetched = get_event(&pool, &event.id).await.unwrap();
        assert_eq!(fetched.event_id, "evt_1");
        assert_eq!(fetched.provider, Provider::Payments);
        assert_eq!(fetched.payload, serde_json::json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn duplicate_event_id_rejected() {
        let pool = test_pool().await;
        let event = sample_event(Provider::Payments, "evt_dup");
        insert_event(&pool, &event).await.unwrap();

        let mut second = sample_event(Provider::Payments, "evt_dup");
        second.id = uuid::Uuid::new_v4().to_string();
        let result = insert_event(&pool, &second).await;
        assert!(matches!(result, Err(Error::Duplicate { .. })));
    }

    #[tokio::test]
    async fn same_event_id_different_provider_allowed() {
        let pool = test_pool().await;
        let a = sample_event(Provider::Payments, "evt_shared");
        let b = sample_event(Provider::Identity, "evt_shared");
        insert_event(&pool, &a).await.unwrap();
        insert_event(&pool, &b).await.unwrap();
    }

    #[tokio::test]
    async fn update_status_persists() {
        let pool = test_pool().await;
        let event = sample_event(Provider::Email, "evt_2");
        insert_event(&pool, &event).await.unwrap();

        update_event_status(&pool, &event.id, EventStatus::Failed, 2, Some("boom"))
            .await
            .unwrap();

        let fetched = get_event(&pool, &event.id).await.unwrap();
        assert_eq!(fetched.status, EventStatus::Failed);
        assert_eq!(fetched.attempt_count, 2);
        assert_eq!(fetched.last_error.as_deref(), Some("boom"));
        assert!(!fetched.processed);
        assert!(fetched.processed_at.is_none());
    }

    #[tokio::test]
    async fn dispatched_status_sets_processed_and_processed_at() {
        let pool = test_pool().await;
        let event = sample_event(Provider::Payments, "evt_processed");
        insert_event(&pool, &event).await.unwrap();

        update_event_status(&pool, &event.id, EventStatus::Dispatched, 0, None)
            .await
            .unwrap();

        let fetched = get_event(&pool, &event.id).await.unwrap();
        assert!(fetched.processed);
        assert!(fetched.processed_at.is_some());
    }

    #[tokio::test]
    async fn list_retryable_respects_attempt_ceiling() {
        let pool = test_pool().await;
        let low = sample_event(Provider::Payments, "evt_low");
        insert_event(&pool, &low).await.unwrap();
        update_event_status(&pool, &low.id, EventStatus::Failed, 2, None)
            .await
            .unwrap();

        let exhausted = sample_event(Provider::Payments, "evt_high");
        insert_event(&pool, &exhausted).await.unwrap();
        update_event_status(&pool, &exhausted.id, EventStatus::Failed, 5, None)
            .await
            .unwrap();

        let retryable = list_retryable(&pool, 5).await.unwrap();
        assert_eq!(retryable.len(), 1);
        assert_eq!(retryable[0].event_id, "evt_low");
    }

    #[tokio::test]
    async fn get_by_provider_and_event_id_finds_composite_key() {
        let pool = test_pool().await;
        insert_event(&pool, &sample_event(Provider::Payments, "evt_composite"))
            .await
            .unwrap();

        let fetched =
            get_event_by_provider_and_event_id(&pool, Provider::Payments, "evt_composite")
                .await
                .unwrap();
        assert_eq!(fetched.event_id, "evt_composite");

        let missing =
            get_event_by_provider_and_event_id(&pool, Provider::Identity, "evt_composite").await;
        assert!(matches!(missing, Err(Error::EventNotFound { .. })));
    }

    #[tokio::test]
    async fn list_events_filters_by_provider_and_status() {
        let pool = test_pool().await;
        insert_event(&pool, &sample_event(Provider::Payments, "evt_a"))
            .await
            .unwrap();
        insert_event(&pool, &sample_event(Provider::Identity, "evt_b"))
            .await
            .unwrap();

        let payments_only = list_events(&pool, Some(Provider::Payments), None, None, 10)
            .await
            .unwrap();
        assert_eq!(payments_only.len(), 1);
        assert_eq!(payments_only[0].event_id, "evt_a");
    }

    #[tokio::test]
    async fn list_events_filters_by_processed() {
        let pool = test_pool().await;
        let done = sample_event(Provider::Payments, "evt_done");
        insert_event(&pool, &done).await.unwrap();
        update_event_status(&pool, &done.id, EventStatus::Dispatched, 0, None)
            .await
            .unwrap();

        insert_event(&pool, &sample_event(Provider::Payments, "evt_pending"))
            .await
            .unwrap();

        let processed_only = list_events(&pool, None, None, Some(true), 10)
            .await
            .unwrap();
        assert_eq!(processed_only.len(), 1);
        assert_eq!(processed_only[0].event_id, "evt_done");

        let unprocessed_only = list_events(&pool, None, None, Some(false), 10)
            .await
            .unwrap();
        assert_eq!(unprocessed_only.len(), 1);
        assert_eq!(unprocessed_only[0].event_id, "evt_pending");
    }
}
