//! Durable storage for synced records and their conflicts.
//!
//! The record-store contract is expressed here as concrete, typed methods
//! over parameterized SQL rather than a literal `Query(sql, params)`
//! passthrough: callers never hand-build SQL, which rules out injection by
//! construction and gives each operation a name that matches what it does.

use crate::error::{Error, Result};
use crate::types::{Conflict, ConflictStatus, Record, ResolutionStrategy, SyncStatus};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            namespace TEXT NOT NULL,
            id TEXT NOT NULL,
            record_type TEXT NOT NULL,
            data TEXT NOT NULL,
            content TEXT NOT NULL,
            repository TEXT,
            path TEXT,
            branch TEXT,
            last_synced_hash TEXT,
            last_synced_at TEXT,
            sync_status TEXT NOT NULL,
            PRIMARY KEY (namespace, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_conflicts (
            id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            record_id TEXT NOT NULL,
            repository TEXT NOT NULL,
            path TEXT NOT NULL,
            branch TEXT NOT NULL,
            expected_hash TEXT NOT NULL,
            observed_hash TEXT NOT NULL,
            local_content TEXT NOT NULL,
            remote_content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            status TEXT NOT NULL,
            strategy TEXT,
            resolved_at TEXT,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    namespace: String,
    id: String,
    record_type: String,
    data: String,
    content: String,
    repository: Option<String>,
    path: Option<String>,
    branch: Option<String>,
    last_synced_hash: Option<String>,
    last_synced_at: Option<String>,
    sync_status: String,
}

fn sync_status_str(status: SyncStatus) -> &'static str {
    match status {
        SyncStatus::Unsynced => "unsynced",
        SyncStatus::Synced => "synced",
        SyncStatus::Dirty => "dirty",
        SyncStatus::Conflict => "conflict",
    }
}

fn parse_sync_status(s: &str) -> Result<SyncStatus> {
    match s {
        "unsynced" => Ok(SyncStatus::Unsynced),
        "synced" => Ok(SyncStatus::Synced),
        "dirty" => Ok(SyncStatus::Dirty),
        "conflict" => Ok(SyncStatus::Conflict),
        other => Err(Error::Config(format!("unknown sync_status in storage: {other}"))),
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    Ok(chrono::DateTime::parse_from_rfc3339(s)
        .map_err(|e| Error::Database(sqlx::Error::Decode(Box::new(e))))?
        .with_timezone(&Utc))
}

impl TryFrom<RecordRow> for Record {
    type Error = Error;

    fn try_from(row: RecordRow) -> Result<Self> {
        Ok(Record {
            namespace: row.namespace,
            id: row.id,
            record_type: row.record_type,
            data: serde_json::from_str(&row.data)?,
            content: row.content,
            repository: row.repository,
            path: row.path,
            branch: row.branch,
            last_synced_hash: row.last_synced_hash,
            last_synced_at: row.last_synced_at.as_deref().map(parse_rfc3339).transpose()?,
            sync_status: parse_sync_status(&row.sync_status)?,
        })
    }
}

/// Insert or fully replace a record (upsert keyed on `(namespace, id)`).
pub async fn upsert_record(pool: &SqlitePool, record: &Record) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO records
            (namespace, id, record_type, data, content, repository, path, branch, last_synced_hash, last_synced_at, sync_status)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(namespace, id) DO UPDATE SET
            record_type = excluded.record_type,
            data = excluded.data,
            content = excluded.content,
            repository = excluded.repository,
            path = excluded.path,
            branch = excluded.branch,
            last_synced_hash = excluded.last_synced_hash,
            last_synced_at = excluded.last_synced_at,
            sync_status = excluded.sync_status
        "#,
    )
    .bind(&record.namespace)
    .bind(&record.id)
    .bind(&record.record_type)
    .bind(record.data.to_string())
    .bind(&record.content)
    .bind(&record.repository)
    .bind(&record.path)
    .bind(&record.branch)
    .bind(&record.last_synced_hash)
    .bind(record.last_synced_at.map(|t| t.to_rfc3339()))
    .bind(sync_status_str(record.sync_status))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_record(pool: &SqlitePool, namespace: &str, id: &str) -> Result<Record> {
    let row = sqlx::query_as::<_, RecordRow>("SELECT * FROM records WHERE namespace = ? AND id = ?")
        .bind(namespace)
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Record::try_from(row),
        None => Err(Error::RecordNotFound {
            namespace: namespace.to_string(),
            id: id.to_string(),
        }),
    }
}

/// Find the record synced to a given `(repository, path)`, if any.
pub async fn find_by_sync_location(
    pool: &SqlitePool,
    repository: &str,
    path: &str,
) -> Result<Option<Record>> {
    let row = sqlx::query_as::<_, RecordRow>(
        "SELECT * FROM records WHERE repository = ? AND path = ?",
    )
    .bind(repository)
    .bind(path)
    .fetch_optional(pool)
    .await?;

    row.map(Record::try_from).transpose()
}

pub async fn list_records(pool: &SqlitePool, namespace: &str) -> Result<Vec<Record>> {
    let rows = sqlx::query_as::<_, RecordRow>(
        "SELECT * FROM records WHERE namespace = ? ORDER BY id ASC",
    )
    .bind(namespace)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Record::try_from).collect()
}

pub async fn list_dirty(pool: &SqlitePool) -> Result<Vec<Record>> {
    let rows = sqlx::query_as::<_, RecordRow>(
        "SELECT * FROM records WHERE sync_status = 'dirty' ORDER BY namespace ASC, id ASC",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Record::try_from).collect()
}

#[derive(sqlx::FromRow)]
struct ConflictRow {
    id: String,
    namespace: String,
    record_id: String,
    repository: String,
    path: String,
    branch: String,
    expected_hash: String,
    observed_hash: String,
    local_content: String,
    remote_content: String,
    created_at: String,
    status: String,
    strategy: Option<String>,
    resolved_at: Option<String>,
    error: Option<String>,
}

fn status_str(status: ConflictStatus) -> &'static str {
    match status {
        ConflictStatus::Pending => "pending",
        ConflictStatus::Resolved => "resolved",
        ConflictStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> Result<ConflictStatus> {
    match s {
        "pending" => Ok(ConflictStatus::Pending),
        "resolved" => Ok(ConflictStatus::Resolved),
        "failed" => Ok(ConflictStatus::Failed),
        other => Err(Error::Config(format!("unknown conflict status in storage: {other}"))),
    }
}

fn strategy_str(strategy: ResolutionStrategy) -> &'static str {
    match strategy {
        ResolutionStrategy::Ours => "ours",
        ResolutionStrategy::Theirs => "theirs",
        ResolutionStrategy::Merge => "merge",
        ResolutionStrategy::Manual => "manual",
    }
}

fn parse_strategy(s: &str) -> Result<ResolutionStrategy> {
    match s {
        "ours" => Ok(ResolutionStrategy::Ours),
        "theirs" => Ok(ResolutionStrategy::Theirs),
        "merge" => Ok(ResolutionStrategy::Merge),
        "manual" => Ok(ResolutionStrategy::Manual),
        other => Err(Error::Config(format!("unknown resolution strategy in storage: {other}"))),
    }
}

impl TryFrom<ConflictRow> for Conflict {
    type Error = Error;

    fn try_from(row: ConflictRow) -> Result<Self> {
        Ok(Conflict {
            id: row.id,
            namespace: row.namespace,
            record_id: row.record_id,
            repository: row.repository,
            path: row.path,
            branch: row.branch,
            expected_hash: row.expected_hash,
            observed_hash: row.observed_hash,
            local_content: row.local_content,
            remote_content: row.remote_content,
            created_at: parse_rfc3339(&row.created_at)?,
            status: parse_status(&row.status)?,
            strategy: row.strategy.as_deref().map(parse_strategy).transpose()?,
            resolved_at: row.resolved_at.as_deref().map(parse_rfc3339).transpose()?,
            error: row.error,
        })
    }
}

pub async fn insert_conflict(pool: &SqlitePool, conflict: &Conflict) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_conflicts
            (id, namespace, record_id, repository, path, branch, expected_hash, observed_hash,
             local_content, remote_content, created_at, status, strategy, resolved_at, error)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&conflict.id)
    .bind(&conflict.namespace)
    .bind(&conflict.record_id)
    .bind(&conflict.repository)
    .bind(&conflict.path)
    .bind(&conflict.branch)
    .bind(&conflict.expected_hash)
    .bind(&conflict.observed_hash)
    .bind(&conflict.local_content)
    .bind(&conflict.remote_content)
    .bind(conflict.created_at.to_rfc3339())
    .bind(status_str(conflict.status))
    .bind(conflict.strategy.map(strategy_str))
    .bind(conflict.resolved_at.map(|t| t.to_rfc3339()))
    .bind(&conflict.error)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_conflict(pool: &SqlitePool, id: &str) -> Result<Conflict> {
    let row = sqlx::query_as::<_, ConflictRow>("SELECT * FROM sync_conflicts WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Conflict::try_from(row),
        None => Err(Error::ConflictNotFound(id.to_string())),
    }
}

pub async fn list_conflicts(pool: &SqlitePool, pending_only: bool) -> Result<Vec<Conflict>> {
    let query = if pending_only {
        "SELECT * FROM sync_conflicts WHERE status = 'pending' ORDER BY created_at ASC"
    } else {
        "SELECT * FROM sync_conflicts ORDER BY created_at ASC"
    };
    let rows = sqlx::query_as::<_, ConflictRow>(query).fetch_all(pool).await?;
    rows.into_iter().map(Conflict::try_from).collect()
}

/// Mark a conflict resolved, recording the strategy that was used.
pub async fn mark_conflict_resolved(
    pool: &SqlitePool,
    id: &str,
    strategy: ResolutionStrategy,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE sync_conflicts SET status = 'resolved', strategy = ?, resolved_at = ?, error = NULL WHERE id = ?",
    )
    .bind(strategy_str(strategy))
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::ConflictNotFound(id.to_string()));
    }
    Ok(())
}

/// Mark a resolution attempt failed; the conflict stays pending-actionable.
pub async fn mark_conflict_failed(pool: &SqlitePool, id: &str, error: &str) -> Result<()> {
    let result = sqlx::query("UPDATE sync_conflicts SET status = 'failed', error = ? WHERE id = ?")
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::ConflictNotFound(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        migrate(&pool).await.unwrap();
        pool
    }

    fn sample_record(namespace: &str, id: &str) -> Record {
        Record {
            namespace: namespace.to_string(),
            id: id.to_string(),
            record_type: "post".to_string(),
            data: json!({"title": "hello"}),
            content: "body".to_string(),
            repository: Some("acme/content".to_string()),
            path: Some(format!("{namespace}/{id}.md")),
            branch: Some("main".to_string()),
            last_synced_hash: Some("abc123".to_string()),
            last_synced_at: Some(Utc::now()),
            sync_status: SyncStatus::Synced,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips() {
        let pool = test_pool().await;
        let record = sample_record("posts", "hello-world");
        upsert_record(&pool, &record).await.unwrap();

        let fetched = get_record(&pool, "posts", "hello-world").await.unwrap();
        assert_eq!(fetched.data, json!({"title": "hello"}));
        assert_eq!(fetched.last_synced_hash.as_deref(), Some("abc123"));
        assert_eq!(fetched.content, "body");
    }

    #[tokio::test]
    async fn upsert_replaces_existing_record() {
        let pool = test_pool().await;
        let mut record = sample_record("posts", "hello-world");
        upsert_record(&pool, &record).await.unwrap();

        record.data = json!({"title": "updated"});
        record.last_synced_hash = Some("def456".to_string());
        upsert_record(&pool, &record).await.unwrap();

        let fetched = get_record(&pool, "posts", "hello-world").await.unwrap();
        assert_eq!(fetched.data, json!({"title": "updated"}));
        assert_eq!(fetched.last_synced_hash.as_deref(), Some("def456"));
    }

    #[tokio::test]
    async fn get_missing_record_errors() {
        let pool = test_pool().await;
        let result = get_record(&pool, "posts", "missing").await;
        assert!(matches!(result, Err(Error::RecordNotFound { .. })));
    }

    #[tokio::test]
    async fn unsynced_record_has_no_sync_location() {
        let pool = test_pool().await;
        let mut record = sample_record("posts", "draft");
        record.repository = None;
        record.path = None;
        record.branch = None;
        record.last_synced_hash = None;
        record.sync_status = SyncStatus::Unsynced;
        upsert_record(&pool, &record).await.unwrap();

        let fetched = get_record(&pool, "posts", "draft").await.unwrap();
        assert!(fetched.sync_target().is_none());
    }

    #[tokio::test]
    async fn find_by_sync_location_locates_record() {
        let pool = test_pool().await;
        let record = sample_record("posts", "hello-world");
        upsert_record(&pool, &record).await.unwrap();

        let found = find_by_sync_location(&pool, "acme/content", "posts/hello-world.md")
            .await
            .unwrap();
        assert!(found.is_some());

        let missing = find_by_sync_location(&pool, "acme/content", "posts/ghost.md")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    fn sample_conflict(id: &str) -> Conflict {
        Conflict {
            id: id.to_string(),
            namespace: "posts".to_string(),
            record_id: "hello-world".to_string(),
            repository: "acme/content".to_string(),
            path: "posts/hello-world.md".to_string(),
            branch: "main".to_string(),
            expected_hash: "h0".to_string(),
            observed_hash: "h2".to_string(),
            local_content: "local doc".to_string(),
            remote_content: "remote doc".to_string(),
            created_at: Utc::now(),
            status: ConflictStatus::Pending,
            strategy: None,
            resolved_at: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn conflict_lifecycle() {
        let pool = test_pool().await;
        insert_conflict(&pool, &sample_conflict("conflict-1")).await.unwrap();

        let pending = list_conflicts(&pool, true).await.unwrap();
        assert_eq!(pending.len(), 1);

        mark_conflict_resolved(&pool, "conflict-1", ResolutionStrategy::Theirs)
            .await
            .unwrap();

        let fetched = get_conflict(&pool, "conflict-1").await.unwrap();
        assert_eq!(fetched.status, ConflictStatus::Resolved);
        assert_eq!(fetched.strategy, Some(ResolutionStrategy::Theirs));

        let pending_after = list_conflicts(&pool, true).await.unwrap();
        assert_eq!(pending_after.len(), 0);
    }

    #[tokio::test]
    async fn conflict_resolution_failure_stays_pending_actionable() {
        let pool = test_pool().await;
        insert_conflict(&pool, &sample_conflict("conflict-2")).await.unwrap();

        mark_conflict_failed(&pool, "conflict-2", "remote unavailable")
            .await
            .unwrap();

        let fetched = get_conflict(&pool, "conflict-2").await.unwrap();
        assert_eq!(fetched.status, ConflictStatus::Failed);
        assert_eq!(fetched.error.as_deref(), Some("remote unavailable"));
    }

    #[tokio::test]
    async fn mark_resolved_on_missing_conflict_errors() {
        let pool = test_pool().await;
        let result = mark_conflict_resolved(&pool, "nonexistent", ResolutionStrategy::Ours).await;
        assert!(matches!(result, Err(Error::ConflictNotFound(_))));
    }
}
