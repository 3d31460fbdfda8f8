//! Per-provider webhook ingress: verify signature, extract the envelope,
//! persist idempotently, and hand off to the dispatcher.

use super::error_response;
use crate::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use relay_core::event_store;
use relay_core::types::{EventStatus, Provider, WebhookEvent};
use relay_core::verify;
use relay_core::Error;
use std::sync::Arc;
use tracing::info;

/// Common envelope shape across payments/identity/email providers: a top
/// level `id` (idempotency key) and `type` (event type) alongside the rest
/// of the payload.
#[derive(serde::Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
}

/// Event type only, for providers whose idempotency key rides on a header
/// rather than the body (the body's own `id` field, if any, is untrusted).
#[derive(serde::Deserialize)]
struct EventTypeOnly {
    #[serde(rename = "type")]
    event_type: String,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Persist the event idempotently and dispatch it, translating the outcome
/// into the response shapes the ingress contract promises: `{success: true,
/// ...handlerResult}` on success, `{already_processed: true}` on a replay of
/// an already-stored `(provider, eventId)`, `{error: <message>}` otherwise.
async fn ingest_common(
    state: &Arc<AppState>,
    provider: Provider,
    event_id: String,
    event_type: String,
    payload: serde_json::Value,
    signature: String,
) -> Response {
    let event = WebhookEvent {
        id: uuid::Uuid::new_v4().to_string(),
        provider,
        event_id,
        event_type,
        payload,
        signature,
        received_at: Utc::now(),
        status: EventStatus::Received,
        processed: false,
        processed_at: None,
        attempt_count: 0,
        last_error: None,
    };

    match event_store::insert_event(&state.pool, &event).await {
        Ok(()) => {}
        Err(Error::Duplicate { provider, event_id }) => {
            info!(%provider, %event_id, "duplicate event, acknowledging without redispatch");
            return (StatusCode::OK, Json(serde_json::json!({ "already_processed": true }))).into_response();
        }
        Err(e) => return error_response(&e),
    }

    match state.dispatcher.dispatch(&event).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "success": true }))).into_response(),
        Err(e) => error_response(&e),
    }
}

fn provider_secret(state: &AppState, get: impl Fn() -> Option<relay_core::config::ConfigValue>) -> Option<String> {
    get().and_then(|c| c.resolve_or_disabled())
}

/// `POST /stripe` — Stripe-like payments provider.
pub async fn payments(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(secret) = provider_secret(&state, || state.config.providers.payments.clone()) else {
        return error_response(&Error::ProviderDisabled("payments".to_string()));
    };

    let Some(sig_header) = header_str(&headers, "stripe-signature") else {
        return error_response(&Error::MalformedHeader("missing stripe-signature".to_string()));
    };
    let signature = sig_header.to_string();

    let verified = match verify::verify_payments(&secret, &signature, &body) {
        Ok(v) => v,
        Err(e) => return error_response(&e),
    };

    if let Some(ts) = verified.timestamp {
        let tolerance_ms = state
            .config
            .retry
            .as_ref()
            .map(|r| r.replay_tolerance_ms)
            .unwrap_or(300_000);
        if let Err(e) = verify::check_replay_tolerance(ts, Utc::now().timestamp(), tolerance_ms) {
            return error_response(&e);
        }
    }

    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => return error_response(&Error::MalformedBody(e.to_string())),
    };
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return error_response(&Error::MalformedBody(e.to_string())),
    };

    ingest_common(
        &state,
        Provider::Payments,
        envelope.id,
        envelope.event_type,
        payload,
        signature,
    )
    .await
}

/// `POST /workos` — WorkOS-like identity provider.
pub async fn identity(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(secret) = provider_secret(&state, || state.config.providers.identity.clone()) else {
        return error_response(&Error::ProviderDisabled("identity".to_string()));
    };

    let Some(sig_header) = header_str(&headers, "workos-signature") else {
        return error_response(&Error::MalformedHeader("missing workos-signature".to_string()));
    };
    let signature = sig_header.to_string();

    let verified = match verify::verify_identity(&secret, &signature, &body) {
        Ok(v) => v,
        Err(e) => return error_response(&e),
    };

    if let Some(ts) = verified.timestamp {
        let tolerance_ms = state
            .config
            .retry
            .as_ref()
            .map(|r| r.replay_tolerance_ms)
            .unwrap_or(300_000);
        if let Err(e) = verify::check_replay_tolerance(ts, Utc::now().timestamp(), tolerance_ms) {
            return error_response(&e);
        }
    }

    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => return error_response(&Error::MalformedBody(e.to_string())),
    };
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return error_response(&Error::MalformedBody(e.to_string())),
    };

    ingest_common(
        &state,
        Provider::Identity,
        envelope.id,
        envelope.event_type,
        payload,
        signature,
    )
    .await
}

/// `POST /github` — GitHub-like source-control provider. Unlike the other
/// three, the idempotency key and event type ride on headers rather than
/// the body, and the signature covers the raw body with no timestamp.
pub async fn source_control(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(secret) = provider_secret(&state, || state.config.providers.source_control.clone())
    else {
        return error_response(&Error::ProviderDisabled("source_control".to_string()));
    };

    let Some(sig_header) = header_str(&headers, "x-hub-signature-256") else {
        return error_response(&Error::MalformedHeader("missing x-hub-signature-256".to_string()));
    };
    let signature = sig_header.to_string();

    if let Err(e) = verify::verify_source_control(&secret, &signature, &body) {
        return error_response(&e);
    }

    let Some(delivery_id) = header_str(&headers, "x-github-delivery") else {
        return error_response(&Error::MalformedHeader("missing x-github-delivery".to_string()));
    };
    let Some(event_type) = header_str(&headers, "x-github-event") else {
        return error_response(&Error::MalformedHeader("missing x-github-event".to_string()));
    };
    let delivery_id = delivery_id.to_string();
    let event_type = event_type.to_string();

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return error_response(&Error::MalformedBody(e.to_string())),
    };

    ingest_common(
        &state,
        Provider::SourceControl,
        delivery_id,
        event_type,
        payload,
        signature,
    )
    .await
}

/// `POST /resend` — Svix-like email provider with rotated, multi-value
/// signatures.
pub async fn email(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(secret) = provider_secret(&state, || state.config.providers.email.clone()) else {
        return error_response(&Error::ProviderDisabled("email".to_string()));
    };

    let (Some(svix_id), Some(svix_timestamp), Some(svix_signature)) = (
        header_str(&headers, "svix-id"),
        header_str(&headers, "svix-timestamp"),
        header_str(&headers, "svix-signature"),
    ) else {
        return error_response(&Error::MalformedHeader(
            "missing svix-id/svix-timestamp/svix-signature".to_string(),
        ));
    };
    let svix_id = svix_id.to_string();
    let signature = svix_signature.to_string();

    let verified = match verify::verify_email(&secret, &svix_id, svix_timestamp, &signature, &body) {
        Ok(v) => v,
        Err(e) => return error_response(&e),
    };

    if let Some(ts) = verified.timestamp {
        let tolerance_ms = state
            .config
            .retry
            .as_ref()
            .map(|r| r.replay_tolerance_ms)
            .unwrap_or(300_000);
        if let Err(e) = verify::check_replay_tolerance(ts, Utc::now().timestamp(), tolerance_ms) {
            return error_response(&e);
        }
    }

    let event_type = serde_json::from_slice::<EventTypeOnly>(&body)
        .map(|e| e.event_type)
        .unwrap_or_else(|_| "unknown".to_string());
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return error_response(&Error::MalformedBody(e.to_string())),
    };

    ingest_common(
        &state,
        Provider::Email,
        svix_id.clone(),
        event_type,
        payload,
        signature,
    )
    .await
}
