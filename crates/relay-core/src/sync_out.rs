//! Sync-out: push locally dirty records to their configured remote
//! source-control location, using the record's last-synced hash as a
//! precondition so a concurrent remote change is detected rather than
//! overwritten.

use crate::error::{Error, Result};
use crate::frontmatter;
use crate::record_store;
use crate::scm::{content_hash, SourceControlApi};
use crate::types::{Conflict, ConflictStatus, Record, SyncStatus};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Push every `dirty` record that names a sync target. Records with no
/// `(repository, path, branch)` stay untouched (they are "unsynced" by
/// choice, not by failure).
pub async fn push_pending(pool: &SqlitePool, scm: &dyn SourceControlApi) -> Result<Vec<PushOutcome>> {
    let dirty = record_store::list_dirty(pool).await?;
    let mut outcomes = Vec::with_capacity(dirty.len());

    for record in dirty {
        if record.sync_target().is_none() {
            continue;
        }
        match push_one(pool, scm, &record).await {
            Ok(()) => outcomes.push(PushOutcome::Pushed {
                namespace: record.namespace,
                id: record.id,
            }),
            Err(Error::ScmHashMismatch { expected, observed }) => {
                warn!(
                    namespace = %record.namespace,
                    id = %record.id,
                    "push precondition failed, remote changed since last sync"
                );
                outcomes.push(PushOutcome::Conflict {
                    namespace: record.namespace,
                    id: record.id,
                    expected,
                    observed,
                });
            }
            Err(e) => return Err(e),
        }
    }

    Ok(outcomes)
}

/// The result of attempting to push a single record.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Pushed {
        namespace: String,
        id: String,
    },
    Conflict {
        namespace: String,
        id: String,
        expected: String,
        observed: String,
    },
}

fn split_owner_repo(repository: &str) -> Result<(&str, &str)> {
    repository
        .split_once('/')
        .ok_or_else(|| Error::Config(format!("malformed repository identifier: {repository}")))
}

/// Push a single dirty record. On a hash-mismatch precondition failure a
/// [`Conflict`] row is persisted and the record is marked `conflict` before
/// the error is propagated, so the caller never has to reconstruct conflict
/// state from a bare error.
pub async fn push_one(pool: &SqlitePool, scm: &dyn SourceControlApi, record: &Record) -> Result<()> {
    let (repository, path, branch) = record
        .sync_target()
        .ok_or_else(|| Error::Config(format!("record {}/{} has no sync target", record.namespace, record.id)))?;
    let (owner, repo) = split_owner_repo(repository)?;

    let document = frontmatter::emit(&record.namespace, &record.id, &record.record_type, &record.data, &record.content)?;

    let push_result = scm
        .put_content(
            owner,
            repo,
            path,
            branch,
            &document,
            &format!("sync: update {}/{}", record.namespace, record.id),
            record.last_synced_hash.as_deref(),
        )
        .await;

    match push_result {
        Ok(new_hash) => {
            let mut updated = record.clone();
            updated.last_synced_hash = Some(new_hash);
            updated.last_synced_at = Some(Utc::now());
            updated.sync_status = SyncStatus::Synced;
            record_store::upsert_record(pool, &updated).await?;
            info!(namespace = %record.namespace, id = %record.id, "pushed record");
            Ok(())
        }
        Err(Error::ScmHashMismatch { expected, observed }) => {
            let remote_content = scm
                .get_content(owner, repo, path, branch)
                .await
                .ok()
                .flatten()
                .map(|f| f.content)
                .unwrap_or_default();

            let conflict = Conflict {
                id: uuid::Uuid::new_v4().to_string(),
                namespace: record.namespace.clone(),
                record_id: record.id.clone(),
                repository: repository.to_string(),
                path: path.to_string(),
                branch: branch.to_string(),
                expected_hash: expected.clone(),
                observed_hash: observed.clone(),
                local_content: document,
                remote_content,
                created_at: Utc::now(),
                status: ConflictStatus::Pending,
                strategy: None,
                resolved_at: None,
                error: None,
            };
            record_store::insert_conflict(pool, &conflict).await?;

            let mut updated = record.clone();
            updated.sync_status = SyncStatus::Conflict;
            record_store::upsert_record(pool, &updated).await?;

            Err(Error::ScmHashMismatch { expected, observed })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_store;
    use crate::scm::RemoteFile;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeScm {
        files: Mutex<std::collections::HashMap<String, (String, String)>>,
        fail_with_mismatch: bool,
    }

    impl FakeScm {
        fn new() -> Self {
            Self {
                files: Mutex::new(std::collections::HashMap::new()),
                fail_with_mismatch: false,
            }
        }

        fn key(owner: &str, repo: &str, path: &str) -> String {
            format!("{owner}/{repo}/{path}")
        }
    }

    #[async_trait]
    impl SourceControlApi for FakeScm {
        async fn get_content(&self, owner: &str, repo: &str, path: &str, _reference: &str) -> Result<Option<RemoteFile>> {
            let files = self.files.lock().unwrap();
            Ok(files
                .get(&FakeScm::key(owner, repo, path))
                .map(|(content, hash)| RemoteFile {
                    content: content.clone(),
                    hash: hash.clone(),
                }))
        }

        async fn put_content(
            &self,
            owner: &str,
            repo: &str,
            path: &str,
            _branch: &str,
            content: &str,
            _message: &str,
            expected_parent_hash: Option<&str>,
        ) -> Result<String> {
            if self.fail_with_mismatch {
                return Err(Error::ScmHashMismatch {
                    expected: expected_parent_hash.unwrap_or("").to_string(),
                    observed: "different".to_string(),
                });
            }
            let new_hash = content_hash(content);
            self.files
                .lock()
                .unwrap()
                .insert(FakeScm::key(owner, repo, path), (content.to_string(), new_hash.clone()));
            Ok(new_hash)
        }
    }

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        record_store::migrate(&pool).await.unwrap();
        pool
    }

    fn dirty_record() -> Record {
        Record {
            namespace: "posts".to_string(),
            id: "hello".to_string(),
            record_type: "post".to_string(),
            data: json!({"title": "Hello"}),
            content: "Hello body".to_string(),
            repository: Some("acme/content".to_string()),
            path: Some("posts/hello.md".to_string()),
            branch: Some("main".to_string()),
            last_synced_hash: None,
            last_synced_at: None,
            sync_status: SyncStatus::Dirty,
        }
    }

    #[tokio::test]
    async fn push_pending_marks_records_synced() {
        let pool = test_pool().await;
        record_store::upsert_record(&pool, &dirty_record()).await.unwrap();

        let scm = FakeScm::new();
        let outcomes = push_pending(&pool, &scm).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], PushOutcome::Pushed { .. }));

        let fetched = record_store::get_record(&pool, "posts", "hello").await.unwrap();
        assert_eq!(fetched.sync_status, SyncStatus::Synced);
        assert!(fetched.last_synced_hash.is_some());
    }

    #[tokio::test]
    async fn push_precondition_mismatch_creates_conflict_and_marks_record() {
        let pool = test_pool().await;
        let mut record = dirty_record();
        record.last_synced_hash = Some("stale-hash".to_string());
        record_store::upsert_record(&pool, &record).await.unwrap();

        let mut scm = FakeScm::new();
        scm.fail_with_mismatch = true;
        let outcomes = push_pending(&pool, &scm).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], PushOutcome::Conflict { .. }));

        let fetched = record_store::get_record(&pool, "posts", "hello").await.unwrap();
        assert_eq!(fetched.sync_status, SyncStatus::Conflict);

        let conflicts = record_store::list_conflicts(&pool, true).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].repository, "acme/content");
        assert_eq!(conflicts[0].path, "posts/hello.md");
    }

    #[tokio::test]
    async fn unsynced_record_is_skipped() {
        let pool = test_pool().await;
        let mut record = dirty_record();
        record.repository = None;
        record.path = None;
        record.branch = None;
        record_store::upsert_record(&pool, &record).await.unwrap();

        let scm = FakeScm::new();
        let outcomes = push_pending(&pool, &scm).await.unwrap();
        assert!(outcomes.is_empty());
    }
}
