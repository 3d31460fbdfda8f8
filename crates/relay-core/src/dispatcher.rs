//! Handler dispatch: routes a verified event to its registered handler and
//! drives the retry loop through the async queue.

use crate::error::{Error, Result};
use crate::queue::{backoff_delay, RetryJob, RetryQueue};
use crate::scm::SourceControlApi;
use crate::sync_in;
use crate::types::{EventStatus, Provider, WebhookEvent};
use crate::{config::RetryConfig, event_store};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A handler for one `(provider, event_type)` pair. Implementations perform
/// whatever side effect the event implies (e.g. forwarding to an internal
/// service); returning `Err` triggers a retry.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &WebhookEvent) -> Result<()>;
}

/// A handler that accepts every event and performs no work beyond logging,
/// used as the default for event types with no registered business logic.
pub struct NoopHandler;

#[async_trait::async_trait]
impl EventHandler for NoopHandler {
    async fn handle(&self, event: &WebhookEvent) -> Result<()> {
        info!(event_id = %event.event_id, provider = %event.provider, "no handler registered, accepting as a no-op");
        Ok(())
    }
}

/// The handler that wires the source-control provider's `push` events into
/// the Sync-In engine: for every file the push touched, reconcile the
/// owning Record (if any) against the now-current remote content.
pub struct SourceControlHandler {
    pool: SqlitePool,
    scm: Arc<dyn SourceControlApi>,
}

impl SourceControlHandler {
    pub fn new(pool: SqlitePool, scm: Arc<dyn SourceControlApi>) -> Self {
        Self { pool, scm }
    }
}

#[derive(serde::Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: PushRepository,
    #[serde(default)]
    commits: Vec<PushCommit>,
}

#[derive(serde::Deserialize)]
struct PushRepository {
    full_name: String,
}

#[derive(serde::Deserialize)]
struct PushCommit {
    #[serde(default)]
    added: Vec<String>,
    #[serde(default)]
    modified: Vec<String>,
}

#[async_trait::async_trait]
impl EventHandler for SourceControlHandler {
    async fn handle(&self, event: &WebhookEvent) -> Result<()> {
        if event.event_type != "push" {
            info!(event_type = %event.event_type, "source-control event type has no sync effect, ignoring");
            return Ok(());
        }

        let payload: PushPayload = serde_json::from_value(event.payload.clone())
            .map_err(|e| Error::MalformedBody(format!("push payload: {e}")))?;
        let branch = payload
            .git_ref
            .strip_prefix("refs/heads/")
            .unwrap_or(&payload.git_ref);

        let mut changed_paths = HashSet::new();
        for commit in &payload.commits {
            changed_paths.extend(commit.added.iter().cloned());
            changed_paths.extend(commit.modified.iter().cloned());
        }

        for path in changed_paths {
            sync_in::pull_one(&self.pool, self.scm.as_ref(), &payload.repository.full_name, &path, branch)
                .await
                .map_err(|e| Error::HandlerFailed(format!("sync-in for {path}: {e}")))?;
        }

        Ok(())
    }
}

/// Maps `(provider, event_type)` to its handler. Handlers are registered
/// once at startup; dispatch is a map lookup, not dynamic reflection.
pub struct HandlerRegistry {
    handlers: HashMap<(Provider, String), Arc<dyn EventHandler>>,
    default: Arc<dyn EventHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            default: Arc::new(NoopHandler),
        }
    }

    pub fn register(
        &mut self,
        provider: Provider,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        self.handlers.insert((provider, event_type.into()), handler);
    }

    fn resolve(&self, provider: Provider, event_type: &str) -> Arc<dyn EventHandler> {
        self.handlers
            .get(&(provider, event_type.to_string()))
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives dispatch of a single event: resolve its handler, run it, and on
/// failure schedule a retry through the queue (up to `config.max_retry_attempts`)
/// or mark the event exhausted.
pub struct Dispatcher {
    pool: SqlitePool,
    registry: Arc<HandlerRegistry>,
    queue: Arc<dyn RetryQueue>,
    config: RetryConfig,
}

impl Dispatcher {
    pub fn new(
        pool: SqlitePool,
        registry: Arc<HandlerRegistry>,
        queue: Arc<dyn RetryQueue>,
        config: RetryConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            queue,
            config,
        }
    }

    /// Dispatch a freshly ingested event immediately.
    pub async fn dispatch(&self, event: &WebhookEvent) -> Result<()> {
        self.attempt(event, 0).await
    }

    /// Retry a previously failed event by its internal id.
    pub async fn retry(&self, event_id: &str, attempt: u32) -> Result<()> {
        let event = event_store::get_event(&self.pool, event_id).await?;
        self.attempt(&event, attempt).await
    }

    async fn attempt(&self, event: &WebhookEvent, attempt: u32) -> Result<()> {
        let handler = self.registry.resolve(event.provider, &event.event_type);

        let outcome = tokio::time::timeout(
            Duration::from_millis(self.config.handler_timeout_ms),
            handler.handle(event),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                event_store::update_event_status(
                    &self.pool,
                    &event.id,
                    EventStatus::Dispatched,
                    attempt,
                    None,
                )
                .await?;
                Ok(())
            }
            Ok(Err(e)) => self.handle_failure(event, attempt, e.to_string()).await,
            Err(_) => {
                self.handle_failure(
                    event,
                    attempt,
                    format!("handler timed out after {}ms", self.config.handler_timeout_ms),
                )
                .await
            }
        }
    }

    async fn handle_failure(
        &self,
        event: &WebhookEvent,
        attempt: u32,
        error_message: String,
    ) -> Result<()> {
        let next_attempt = attempt + 1;

        if next_attempt >= self.config.max_retry_attempts {
            warn!(
                event_id = %event.event_id,
                attempts = next_attempt,
                "retry attempts exhausted, marking event exhausted"
            );
            event_store::update_event_status(
                &self.pool,
                &event.id,
                EventStatus::Exhausted,
                next_attempt,
                Some(&error_message),
            )
            .await?;
            return Err(Error::HandlerFailed(error_message));
        }

        event_store::update_event_status(
            &self.pool,
            &event.id,
            EventStatus::Failed,
            next_attempt,
            Some(&error_message),
        )
        .await?;

        let delay = backoff_delay(
            next_attempt,
            Duration::from_millis(self.config.retry_base_delay_ms),
            Duration::from_millis(self.config.retry_max_delay_ms),
        );

        self.queue
            .schedule(
                RetryJob {
                    event_id: event.id.clone(),
                    attempt: next_attempt,
                },
                delay,
            )
            .await;

        Ok(())
    }

    /// Runs forever, pulling retry jobs off the queue and re-attempting
    /// dispatch. Intended to be spawned as a background task.
    pub async fn run_retry_loop(self: Arc<Self>) {
        while let Some(job) = self.queue.recv().await {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.retry(&job.event_id, job.attempt).await {
                    warn!(event_id = %job.event_id, error = %e, "retry attempt failed");
                }
            });
        }
    }
}
