//! relay CLI - command line interface for the webhook ingestion and sync engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_core::config::{resolve_config, RelayConfig};
use relay_core::dispatcher::{Dispatcher, HandlerRegistry, SourceControlHandler};
use relay_core::queue::InProcessQueue;
use relay_core::scm::{GitHubScmClient, SourceControlApi};
use relay_core::types::{EventStatus, Provider, ResolutionStrategy};
use relay_core::{event_store, record_store, sync_in};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Multi-provider webhook ingestion and bidirectional sync engine")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server
    Serve,

    /// Run database migrations and exit
    Migrate,

    /// Inspect ingested events
    Events {
        #[command(subcommand)]
        what: EventsCommands,
    },

    /// Inspect and resolve sync conflicts
    Conflicts {
        #[command(subcommand)]
        what: ConflictsCommands,
    },
}

#[derive(Subcommand)]
enum EventsCommands {
    /// List recently ingested events
    List {
        /// Filter by provider: payments, identity, source_control, email
        #[arg(long)]
        provider: Option<String>,

        /// Filter by status: received, dispatched, failed, exhausted
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Retry a specific event by provider and its idempotency key
    Retry {
        /// payments, identity, source_control, or email
        provider: String,
        event_id: String,
    },
}

#[derive(Subcommand)]
enum ConflictsCommands {
    /// List pending sync conflicts
    List,

    /// Resolve a conflict: ours, theirs, merge, or manual (always fails)
    Resolve { conflict_id: String, strategy: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => cmd_serve(cli.config.as_deref()).await,
        Commands::Migrate => cmd_migrate(cli.config.as_deref()).await,
        Commands::Events { what } => cmd_events(cli.config.as_deref(), what).await,
        Commands::Conflicts { what } => cmd_conflicts(cli.config.as_deref(), what).await,
    }
}

fn provider_from_str(s: &str) -> Result<Provider> {
    match s {
        "payments" => Ok(Provider::Payments),
        "identity" => Ok(Provider::Identity),
        "source_control" => Ok(Provider::SourceControl),
        "email" => Ok(Provider::Email),
        other => anyhow::bail!("unknown provider: {other}"),
    }
}

fn status_from_str(s: &str) -> Result<EventStatus> {
    match s {
        "received" => Ok(EventStatus::Received),
        "dispatched" => Ok(EventStatus::Dispatched),
        "failed" => Ok(EventStatus::Failed),
        "exhausted" => Ok(EventStatus::Exhausted),
        other => anyhow::bail!("unknown status: {other}"),
    }
}

fn strategy_from_str(s: &str) -> Result<ResolutionStrategy> {
    match s {
        "ours" => Ok(ResolutionStrategy::Ours),
        "theirs" => Ok(ResolutionStrategy::Theirs),
        "merge" => Ok(ResolutionStrategy::Merge),
        "manual" => Ok(ResolutionStrategy::Manual),
        other => anyhow::bail!("unknown resolution strategy: {other}"),
    }
}

fn build_scm(config: &RelayConfig) -> Result<Arc<dyn SourceControlApi>> {
    let scm_config = config
        .scm
        .as_ref()
        .context("no [scm] section configured")?;
    let token = scm_config
        .token
        .as_ref()
        .context("scm.token not configured")?
        .resolve()?;
    Ok(Arc::new(GitHubScmClient::new(scm_config.api_base.clone(), token)))
}

fn build_registry(pool: sqlx::SqlitePool, scm: Arc<dyn SourceControlApi>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(
        Provider::SourceControl,
        "push",
        Arc::new(SourceControlHandler::new(pool, scm)),
    );
    registry
}

async fn cmd_serve(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let pool = event_store::connect(&config.database.url).await?;
    record_store::migrate(&pool).await?;

    let scm = build_scm(&config)?;
    let registry = Arc::new(build_registry(pool.clone(), scm.clone()));
    let queue = Arc::new(InProcessQueue::new());
    let retry_config = config.retry.clone().unwrap_or_default();
    let dispatcher = Arc::new(Dispatcher::new(pool.clone(), registry, queue, retry_config));

    let retry_loop = dispatcher.clone();
    tokio::spawn(async move {
        retry_loop.run_retry_loop().await;
    });

    let server_config = config.server.clone().unwrap_or_default();
    let addr = format!("{}:{}", server_config.host, server_config.port).parse()?;

    let state = Arc::new(relay_api::AppState {
        pool,
        config,
        dispatcher,
        scm,
        shutting_down: Arc::new(std::sync::atomic::AtomicBool::new(false)),
    });

    relay_api::serve(state, addr).await?;
    Ok(())
}

async fn cmd_migrate(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let pool = event_store::connect(&config.database.url).await?;
    record_store::migrate(&pool).await?;
    println!("migrations applied");
    Ok(())
}

async fn cmd_events(config_path: Option<&std::path::Path>, what: EventsCommands) -> Result<()> {
    let config = resolve_config(config_path)?;
    let pool = event_store::connect(&config.database.url).await?;

    match what {
        EventsCommands::List {
            provider,
            status,
            limit,
        } => {
            let provider = provider.map(|p| provider_from_str(&p)).transpose()?;
            let status = status.map(|s| status_from_str(&s)).transpose()?;
            let events = event_store::list_events(&pool, provider, status, None, limit).await?;

            if events.is_empty() {
                println!("No events found.");
            } else {
                for event in &events {
                    println!(
                        "{} [{}] {} {} attempts={} status={:?}",
                        event.id, event.provider, event.event_id, event.event_type, event.attempt_count, event.status
                    );
                }
                println!("\nTotal: {} events", events.len());
            }
        }
        EventsCommands::Retry { provider, event_id } => {
            let provider = provider_from_str(&provider)?;
            let event = event_store::get_event_by_provider_and_event_id(&pool, provider, &event_id).await?;

            let scm = build_scm(&config)?;
            let registry = Arc::new(build_registry(pool.clone(), scm));
            let queue = Arc::new(InProcessQueue::new());
            let retry_config = config.retry.clone().unwrap_or_default();
            let dispatcher = Dispatcher::new(pool, registry, queue, retry_config);
            dispatcher.retry(&event.id, event.attempt_count).await?;
            println!("retried {provider}/{event_id}");
        }
    }

    Ok(())
}

async fn cmd_conflicts(config_path: Option<&std::path::Path>, what: ConflictsCommands) -> Result<()> {
    let config = resolve_config(config_path)?;
    let pool = event_store::connect(&config.database.url).await?;
    record_store::migrate(&pool).await?;

    match what {
        ConflictsCommands::List => {
            let conflicts = record_store::list_conflicts(&pool, true).await?;
            if conflicts.is_empty() {
                println!("No pending conflicts.");
            } else {
                for conflict in &conflicts {
                    println!(
                        "{} {}/{} repo={} path={} expected={} observed={}",
                        conflict.id,
                        conflict.namespace,
                        conflict.record_id,
                        conflict.repository,
                        conflict.path,
                        conflict.expected_hash,
                        conflict.observed_hash
                    );
                }
                println!("\nTotal: {} pending conflicts", conflicts.len());
            }
        }
        ConflictsCommands::Resolve { conflict_id, strategy } => {
            let strategy = strategy_from_str(&strategy)?;
            let scm = build_scm(&config)?;
            let record = sync_in::resolve_conflict(&pool, scm.as_ref(), &conflict_id, strategy).await?;
            println!("resolved {} -> synced, new hash {:?}", record.id, record.last_synced_hash);
        }
    }

    Ok(())
}
