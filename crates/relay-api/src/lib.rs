//! HTTP API server: webhook ingress routes, management endpoints, and the
//! middleware stack (auth, rate limiting, CORS, tracing) wrapping them.

pub mod handlers;
pub mod middleware;

use axum::extract::FromRef;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use relay_core::config::RelayConfig;
use relay_core::dispatcher::Dispatcher;
use relay_core::scm::SourceControlApi;
use sqlx::SqlitePool;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::KeyExtractor;
use tower_governor::GovernorLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// Shared application state threaded through every handler.
pub struct AppState {
    pub pool: SqlitePool,
    pub config: RelayConfig,
    pub dispatcher: Arc<Dispatcher>,
    pub scm: Arc<dyn SourceControlApi>,
    /// Flipped to `true` as soon as a shutdown signal arrives, before the
    /// listener stops accepting connections. Checked by
    /// [`middleware::shutdown_middleware`] to refuse new ingress requests.
    pub shutting_down: Arc<AtomicBool>,
}

impl FromRef<Arc<AppState>> for Arc<AppState> {
    fn from_ref(state: &Arc<AppState>) -> Self {
        state.clone()
    }
}

/// Rate-limit key extractor: bucket by client IP, falling back to a
/// constant key behind a proxy that does not forward the real address
/// (rate limiting still applies, just coarsely).
#[derive(Clone)]
pub struct RelayKeyExtractor;

impl KeyExtractor for RelayKeyExtractor {
    type Key = String;

    fn extract<B>(&self, req: &axum::http::Request<B>) -> Result<Self::Key, tower_governor::GovernorError> {
        if let Some(forwarded) = req.headers().get("x-forwarded-for") {
            if let Ok(s) = forwarded.to_str() {
                if let Some(first) = s.split(',').next() {
                    return Ok(first.trim().to_string());
                }
            }
        }
        Ok(req
            .extensions()
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string()))
    }
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(tower_http::cors::Any)
            .allow_origin(tower_http::cors::Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
        .allow_origin(AllowOrigin::list(parsed))
}

/// Build the full router: webhook ingress per provider, plus management
/// endpoints gated behind bearer auth.
pub fn build_router(state: Arc<AppState>) -> Router {
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(30)
            .key_extractor(RelayKeyExtractor)
            .finish()
            .expect("valid governor config"),
    );

    let cors = build_cors_layer(
        state
            .config
            .server
            .as_ref()
            .map(|s| s.cors_origins.clone())
            .unwrap_or_default()
            .as_slice(),
    );

    let ingress = Router::new()
        .route("/stripe", post(handlers::ingress::payments))
        .route("/workos", post(handlers::ingress::identity))
        .route("/github", post(handlers::ingress::source_control))
        .route("/resend", post(handlers::ingress::email))
        .layer(GovernorLayer {
            config: governor_conf,
        })
        .layer(from_fn_with_state(state.clone(), middleware::shutdown_middleware));

    let management = Router::new()
        .route("/api/events", get(handlers::management::list_events))
        .route(
            "/api/events/{provider}/{event_id}",
            get(handlers::management::get_event),
        )
        .route(
            "/api/events/{provider}/{event_id}/retry",
            post(handlers::management::retry_event),
        )
        .route("/api/conflicts", get(handlers::management::list_conflicts))
        .route(
            "/api/conflicts/{id}/resolve",
            post(handlers::management::resolve_conflict),
        )
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware));

    Router::new()
        .merge(ingress)
        .merge(management)
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

/// Run the server until a shutdown signal arrives.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> std::io::Result<()> {
    let shutting_down = state.shutting_down.clone();
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "relay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutting_down))
        .await
}

/// Waits for Ctrl+C or SIGTERM, flips `shutting_down` the instant one
/// arrives, then returns so `axum::serve` starts draining in-flight
/// connections. The flag flip happens before this future resolves, so
/// `shutdown_middleware` starts refusing new requests no later than the
/// listener stops accepting them.
async fn shutdown_signal(shutting_down: Arc<AtomicBool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    shutting_down.store(true, std::sync::atomic::Ordering::SeqCst);
    tracing::info!("shutdown signal received, refusing new requests and draining in-flight ones");
}
