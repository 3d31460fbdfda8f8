//! Sync-in: apply an external commit back onto the Record it owns, detecting
//! a conflict whenever the external hash has moved away from what we last
//! observed, and resolving previously detected conflicts on request.

use crate::error::{Error, Result};
use crate::frontmatter;
use crate::record_store;
use crate::scm::SourceControlApi;
use crate::types::{Conflict, ConflictStatus, Record, ResolutionStrategy, SyncStatus};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

/// Outcome of reconciling one changed file against the Record it owns.
#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    /// No Record is synced to this `(repository, path)`; nothing to do.
    NotOwned,
    /// The external hash matched our last-synced hash; the Record was
    /// refreshed from the remote file and stays `synced`.
    FastForwarded,
    /// The external hash moved; a [`Conflict`] was recorded and the Record
    /// was marked `conflict`.
    Conflicted(Conflict),
}

fn split_owner_repo(repository: &str) -> Result<(&str, &str)> {
    repository
        .split_once('/')
        .ok_or_else(|| Error::Config(format!("malformed repository identifier: {repository}")))
}

/// Reconcile one changed file from a source-control push event against the
/// Record synced to `(repository, path)`. `branch` is the ref the change
/// landed on; a Record synced to a different branch is left untouched.
pub async fn pull_one(
    pool: &SqlitePool,
    scm: &dyn SourceControlApi,
    repository: &str,
    path: &str,
    branch: &str,
) -> Result<PullOutcome> {
    let Some(record) = record_store::find_by_sync_location(pool, repository, path).await? else {
        return Ok(PullOutcome::NotOwned);
    };
    if record.branch.as_deref() != Some(branch) {
        return Ok(PullOutcome::NotOwned);
    }

    let (owner, repo) = split_owner_repo(repository)?;
    let remote = scm.get_content(owner, repo, path, branch).await?;
    let Some(remote) = remote else {
        return Ok(PullOutcome::NotOwned);
    };

    if record.last_synced_hash.as_deref() == Some(remote.hash.as_str()) {
        return Ok(PullOutcome::NotOwned);
    }

    // The observed hash differs from what we last synced. If nothing has
    // happened locally since that sync, this is a clean fast-forward;
    // otherwise both sides diverged from the shared parent.
    let remote_doc = frontmatter::parse(&remote.content)?;

    if record.sync_status != SyncStatus::Dirty {
        let updated = Record {
            data: remote_doc.data,
            content: remote_doc.content,
            record_type: remote_doc.record_type,
            last_synced_hash: Some(remote.hash.clone()),
            last_synced_at: Some(Utc::now()),
            sync_status: SyncStatus::Synced,
            ..record
        };
        record_store::upsert_record(pool, &updated).await?;
        info!(namespace = %updated.namespace, id = %updated.id, "fast-forwarded record from remote");
        return Ok(PullOutcome::FastForwarded);
    }

    let local_document = frontmatter::emit(&record.namespace, &record.id, &record.record_type, &record.data, &record.content)?;
    let expected_hash = record.last_synced_hash.clone().unwrap_or_default();

    let conflict = Conflict {
        id: uuid::Uuid::new_v4().to_string(),
        namespace: record.namespace.clone(),
        record_id: record.id.clone(),
        repository: repository.to_string(),
        path: path.to_string(),
        branch: branch.to_string(),
        expected_hash,
        observed_hash: remote.hash.clone(),
        local_content: local_document,
        remote_content: remote.content.clone(),
        created_at: Utc::now(),
        status: ConflictStatus::Pending,
        strategy: None,
        resolved_at: None,
        error: None,
    };
    record_store::insert_conflict(pool, &conflict).await?;

    let mut marked = record;
    marked.sync_status = SyncStatus::Conflict;
    record_store::upsert_record(pool, &marked).await?;

    info!(namespace = %marked.namespace, id = %marked.id, "conflict detected during pull");
    Ok(PullOutcome::Conflicted(conflict))
}

/// Resolve a previously detected conflict. `ours`, `theirs`, and `merge`
/// push synchronously against the currently-observed external hash (not the
/// hash recorded on the Conflict row, which may itself be stale by now);
/// `manual` is reserved and always fails with `not_implemented`.
pub async fn resolve_conflict(
    pool: &SqlitePool,
    scm: &dyn SourceControlApi,
    conflict_id: &str,
    strategy: ResolutionStrategy,
) -> Result<Record> {
    let conflict = record_store::get_conflict(pool, conflict_id).await?;

    if strategy == ResolutionStrategy::Manual {
        return Err(Error::NotImplemented("manual conflict resolution".to_string()));
    }

    let record = record_store::get_record(pool, &conflict.namespace, &conflict.record_id).await?;
    let (owner, repo) = split_owner_repo(&conflict.repository)?;

    let current = scm
        .get_content(owner, repo, &conflict.path, &conflict.branch)
        .await?;
    let observed_hash = current.as_ref().map(|f| f.hash.clone());

    let resolution = match strategy {
        ResolutionStrategy::Ours => {
            let document = frontmatter::emit(&record.namespace, &record.id, &record.record_type, &record.data, &record.content)?;
            Resolution { record: record.clone(), document }
        }
        ResolutionStrategy::Theirs => {
            let remote = current
                .clone()
                .ok_or_else(|| Error::ScmApi("remote file no longer exists".to_string()))?;
            let remote_doc = frontmatter::parse(&remote.content)?;
            let resolved = Record {
                data: remote_doc.data,
                content: remote_doc.content,
                record_type: remote_doc.record_type,
                ..record.clone()
            };
            Resolution { record: resolved, document: remote.content }
        }
        ResolutionStrategy::Merge => {
            let remote = current
                .clone()
                .ok_or_else(|| Error::ScmApi("remote file no longer exists".to_string()))?;
            let remote_doc = frontmatter::parse(&remote.content)?;
            let merged_data = merge_prefer_local(&record.data, &remote_doc.data)?;
            let resolved = Record {
                data: merged_data,
                content: record.content.clone(),
                ..record.clone()
            };
            let document = frontmatter::emit(
                &resolved.namespace,
                &resolved.id,
                &resolved.record_type,
                &resolved.data,
                &resolved.content,
            )?;
            Resolution { record: resolved, document }
        }
        ResolutionStrategy::Manual => unreachable!("handled above"),
    };

    let push = scm
        .put_content(
            owner,
            repo,
            &conflict.path,
            &conflict.branch,
            &resolution.document,
            &format!("resolve conflict: {}/{}", conflict.namespace, conflict.record_id),
            observed_hash.as_deref(),
        )
        .await;

    match push {
        Ok(new_hash) => {
            let mut resolved_record = resolution.record;
            resolved_record.last_synced_hash = Some(new_hash);
            resolved_record.last_synced_at = Some(Utc::now());
            resolved_record.sync_status = SyncStatus::Synced;
            record_store::upsert_record(pool, &resolved_record).await?;
            record_store::mark_conflict_resolved(pool, conflict_id, strategy).await?;
            Ok(resolved_record)
        }
        Err(e) => {
            record_store::mark_conflict_failed(pool, conflict_id, &e.to_string()).await?;
            Err(e)
        }
    }
}

struct Resolution {
    record: Record,
    document: String,
}

/// Shallow field merge: local values win where both sides set the same key,
/// remote-only keys are carried over. Both inputs must be JSON objects.
fn merge_prefer_local(local: &serde_json::Value, remote: &serde_json::Value) -> Result<serde_json::Value> {
    let local_map = local
        .as_object()
        .ok_or_else(|| Error::FrontmatterParse("merge requires object data".to_string()))?;
    let remote_map = remote
        .as_object()
        .ok_or_else(|| Error::FrontmatterParse("merge requires object data".to_string()))?;

    let mut merged = remote_map.clone();
    for (key, value) in local_map {
        merged.insert(key.clone(), value.clone());
    }
    Ok(serde_json::Value::Object(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scm::{content_hash, RemoteFile};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeScm {
        files: Mutex<std::collections::HashMap<String, (String, String)>>,
    }

    impl FakeScm {
        fn new() -> Self {
            Self {
                files: Mutex::new(std::collections::HashMap::new()),
            }
        }

        fn set(&self, path: &str, content: &str) -> String {
            let hash = content_hash(content);
            self.files
                .lock()
                .unwrap()
                .insert(format!("acme/content/{path}"), (content.to_string(), hash.clone()));
            hash
        }
    }

    #[async_trait]
    impl SourceControlApi for FakeScm {
        async fn get_content(&self, owner: &str, repo: &str, path: &str, _reference: &str) -> Result<Option<RemoteFile>> {
            let files = self.files.lock().unwrap();
            Ok(files
                .get(&format!("{owner}/{repo}/{path}"))
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
            _expected_parent_hash: Option<&str>,
        ) -> Result<String> {
            let new_hash = content_hash(content);
            self.files
                .lock()
                .unwrap()
                .insert(format!("{owner}/{repo}/{path}"), (content.to_string(), new_hash.clone()));
            Ok(new_hash)
        }
    }

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        record_store::migrate(&pool).await.unwrap();
        pool
    }

    fn synced_record(hash: &str) -> Record {
        Record {
            namespace: "posts".to_string(),
            id: "hello".to_string(),
            record_type: "post".to_string(),
            data: json!({"title": "Original"}),
            content: "Original body".to_string(),
            repository: Some("acme/content".to_string()),
            path: Some("posts/hello.md".to_string()),
            branch: Some("main".to_string()),
            last_synced_hash: Some(hash.to_string()),
            last_synced_at: Some(Utc::now()),
            sync_status: SyncStatus::Synced,
        }
    }

    #[tokio::test]
    async fn pull_not_owned_when_no_record_synced_there() {
        let pool = test_pool().await;
        let scm = FakeScm::new();
        scm.set("posts/hello.md", "---\n$id: posts/hello\n$type: post\n---\nbody");

        let outcome = pull_one(&pool, &scm, "acme/content", "posts/hello.md", "main")
            .await
            .unwrap();
        assert_eq!(outcome, PullOutcome::NotOwned);
    }

    #[tokio::test]
    async fn pull_not_owned_when_hash_unchanged() {
        let pool = test_pool().await;
        let scm = FakeScm::new();
        let hash = scm.set("posts/hello.md", "---\n$id: posts/hello\n$type: post\n---\nbody");
        record_store::upsert_record(&pool, &synced_record(&hash)).await.unwrap();

        let outcome = pull_one(&pool, &scm, "acme/content", "posts/hello.md", "main")
            .await
            .unwrap();
        assert_eq!(outcome, PullOutcome::NotOwned);
    }

    #[tokio::test]
    async fn pull_fast_forwards_clean_record() {
        let pool = test_pool().await;
        let scm = FakeScm::new();
        record_store::upsert_record(&pool, &synced_record("h0")).await.unwrap();
        scm.set(
            "posts/hello.md",
            "---\n$id: posts/hello\n$type: post\ntitle: Updated remotely\n---\nnew body",
        );

        let outcome = pull_one(&pool, &scm, "acme/content", "posts/hello.md", "main")
            .await
            .unwrap();
        assert_eq!(outcome, PullOutcome::FastForwarded);

        let record = record_store::get_record(&pool, "posts", "hello").await.unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.data, json!({"title": "Updated remotely"}));
        assert_eq!(record.content, "new body");
    }

    #[tokio::test]
    async fn pull_detects_conflict_when_record_is_dirty() {
        let pool = test_pool().await;
        let scm = FakeScm::new();
        let mut record = synced_record("h0");
        record.sync_status = SyncStatus::Dirty;
        record.data = json!({"title": "Local edit"});
        record_store::upsert_record(&pool, &record).await.unwrap();

        scm.set("posts/hello.md", "---\n$id: posts/hello\n$type: post\ntitle: Remote edit\n---\nremote body");

        let outcome = pull_one(&pool, &scm, "acme/content", "posts/hello.md", "main")
            .await
            .unwrap();
        assert!(matches!(outcome, PullOutcome::Conflicted(_)));

        let fetched = record_store::get_record(&pool, "posts", "hello").await.unwrap();
        assert_eq!(fetched.sync_status, SyncStatus::Conflict);

        let conflicts = record_store::list_conflicts(&pool, true).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].expected_hash, "h0");
    }

    async fn seeded_conflict(pool: &SqlitePool, scm: &FakeScm) -> Conflict {
        let mut record = synced_record("h0");
        record.sync_status = SyncStatus::Dirty;
        record.data = json!({"title": "Local edit", "notes": "keep"});
        record_store::upsert_record(pool, &record).await.unwrap();

        scm.set(
            "posts/hello.md",
            "---\n$id: posts/hello\n$type: post\ntitle: Remote edit\nextra: added\n---\nremote body",
        );

        match pull_one(pool, scm, "acme/content", "posts/hello.md", "main").await.unwrap() {
            PullOutcome::Conflicted(c) => c,
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_ours_force_pushes_local_against_observed_hash() {
        let pool = test_pool().await;
        let scm = FakeScm::new();
        let conflict = seeded_conflict(&pool, &scm).await;

        let resolved = resolve_conflict(&pool, &scm, &conflict.id, ResolutionStrategy::Ours)
            .await
            .unwrap();
        assert_eq!(resolved.sync_status, SyncStatus::Synced);
        assert_eq!(resolved.data, json!({"title": "Local edit", "notes": "keep"}));

        let stored = record_store::get_conflict(&pool, &conflict.id).await.unwrap();
        assert_eq!(stored.status, ConflictStatus::Resolved);
        assert_eq!(stored.strategy, Some(ResolutionStrategy::Ours));

        // The force-push used the hash observed right now, not the stale
        // expected_hash recorded on the conflict row.
        assert_ne!(resolved.last_synced_hash.unwrap(), conflict.expected_hash);
    }

    #[tokio::test]
    async fn resolve_theirs_adopts_remote_data() {
        let pool = test_pool().await;
        let scm = FakeScm::new();
        let conflict = seeded_conflict(&pool, &scm).await;

        let resolved = resolve_conflict(&pool, &scm, &conflict.id, ResolutionStrategy::Theirs)
            .await
            .unwrap();
        assert_eq!(resolved.data, json!({"title": "Remote edit", "extra": "added"}));
    }

    #[tokio::test]
    async fn resolve_merge_prefers_local_on_overlap() {
        let pool = test_pool().await;
        let scm = FakeScm::new();
        let conflict = seeded_conflict(&pool, &scm).await;

        let resolved = resolve_conflict(&pool, &scm, &conflict.id, ResolutionStrategy::Merge)
            .await
            .unwrap();
        assert_eq!(
            resolved.data,
            json!({"title": "Local edit", "notes": "keep", "extra": "added"})
        );
    }

    #[tokio::test]
    async fn resolve_manual_is_always_not_implemented() {
        let pool = test_pool().await;
        let scm = FakeScm::new();
        let conflict = seeded_conflict(&pool, &scm).await;

        let result = resolve_conflict(&pool, &scm, &conflict.id, ResolutionStrategy::Manual).await;
        assert!(matches!(result, Err(Error::NotImplemented(_))));

        let stored = record_store::get_conflict(&pool, &conflict.id).await.unwrap();
        assert_eq!(stored.status, ConflictStatus::Pending);
    }
}
