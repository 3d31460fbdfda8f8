//! Management endpoints: inspect ingested events and resolve sync conflicts.
//! Gated behind bearer auth by [`crate::middleware::auth_middleware`].

use super::error_response;
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_core::record_store;
use relay_core::sync_in;
use relay_core::types::{Provider, ResolutionStrategy};
use relay_core::{event_store, Error};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct ListEventsQuery {
    provider: Option<String>,
    processed: Option<bool>,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

fn parse_provider(s: &str) -> Option<Provider> {
    match s {
        "payments" => Some(Provider::Payments),
        "identity" => Some(Provider::Identity),
        "source_control" => Some(Provider::SourceControl),
        "email" => Some(Provider::Email),
        _ => None,
    }
}

pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListEventsQuery>,
) -> Response {
    let provider = query.provider.as_deref().and_then(parse_provider);

    match event_store::list_events(&state.pool, provider, None, query.processed, query.limit).await {
        Ok(events) => {
            let count = events.len();
            Json(serde_json::json!({ "events": events, "count": count })).into_response()
        }
        Err(e) => error_response(&e),
    }
}

fn resolve_path_provider(provider: &str) -> Result<Provider, Error> {
    parse_provider(provider).ok_or_else(|| Error::EventNotFound {
        provider: provider.to_string(),
        event_id: String::new(),
    })
}

pub async fn get_event(
    State(state): State<Arc<AppState>>,
    Path((provider, event_id)): Path<(String, String)>,
) -> Response {
    let provider = match resolve_path_provider(&provider) {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };

    match event_store::get_event_by_provider_and_event_id(&state.pool, provider, &event_id).await {
        Ok(event) => Json(event).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn retry_event(
    State(state): State<Arc<AppState>>,
    Path((provider, event_id)): Path<(String, String)>,
) -> Response {
    let provider = match resolve_path_provider(&provider) {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };

    let event = match event_store::get_event_by_provider_and_event_id(&state.pool, provider, &event_id).await {
        Ok(event) => event,
        Err(e) => return error_response(&e),
    };

    match state.dispatcher.retry(&event.id, event.attempt_count).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn list_conflicts(State(state): State<Arc<AppState>>) -> Response {
    match record_store::list_conflicts(&state.pool, true).await {
        Ok(conflicts) => {
            let count = conflicts.len();
            Json(serde_json::json!({ "conflicts": conflicts, "count": count })).into_response()
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct ResolveConflictBody {
    strategy: String,
}

fn parse_strategy(s: &str) -> Result<ResolutionStrategy, Error> {
    match s {
        "ours" => Ok(ResolutionStrategy::Ours),
        "theirs" => Ok(ResolutionStrategy::Theirs),
        "merge" => Ok(ResolutionStrategy::Merge),
        "manual" => Ok(ResolutionStrategy::Manual),
        other => Err(Error::MalformedBody(format!("unknown strategy: {other}"))),
    }
}

pub async fn resolve_conflict(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ResolveConflictBody>,
) -> Response {
    let strategy = match parse_strategy(&body.strategy) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };

    match sync_in::resolve_conflict(&state.pool, state.scm.as_ref(), &id, strategy).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_response(&e),
    }
}
