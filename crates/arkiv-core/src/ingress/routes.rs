//! HTTP handlers for the ingress surface.
//!
//! `/ingest` validates the payload shape, acknowledges with `202`, and
//! schedules the job in the background; processing never blocks the
//! webhook response. The remaining endpoints are small operator surfaces:
//! batch ingest, replay, per-ticket status, liveness, and metrics.

use axum::body::Bytes;
use axum::extract::{Extension, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use subtle::ConstantTimeEq;

use super::error::IngressError;
use super::middleware::{RequestId, DELIVERY_ID_HEADER};
use super::AppState;
use crate::pipeline::JobContext;

/// Coerces a JSON value into a positive ticket id.
///
/// Digits-only strings (with an optional leading `+`) parse; booleans,
/// floats, zero, and negatives are rejected.
#[must_use]
pub fn coerce_ticket_id(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(number) => number.as_u64().filter(|id| *id > 0),
        serde_json::Value::String(raw) => {
            let text = raw.trim();
            let text = text.strip_prefix('+').unwrap_or(text);
            if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            text.parse::<u64>().ok().filter(|id| *id > 0)
        },
        _ => None,
    }
}

/// Pulls the ticket id out of a webhook payload: `ticket.id` when a
/// ticket object is present, `ticket_id` otherwise.
fn extract_ticket_id(payload: &serde_json::Value) -> Option<u64> {
    if let Some(ticket) = payload.get("ticket") {
        if ticket.is_object() {
            return coerce_ticket_id(ticket.get("id")?);
        }
    }
    coerce_ticket_id(payload.get("ticket_id")?)
}

fn webhook_user_login(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("user")
        .and_then(|user| user.get("login"))
        .and_then(|login| login.as_str())
        .map(str::trim)
        .filter(|login| !login.is_empty())
        .map(ToOwned::to_owned)
}

fn delivery_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DELIVERY_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn schedule(state: &AppState, ctx: JobContext) -> Result<(), IngressError> {
    let pipeline = std::sync::Arc::clone(&state.pipeline);
    state
        .executor
        .try_dispatch(Box::pin(async move {
            pipeline.process_ticket(ctx).await;
        }))
        .map_err(|err| {
            tracing::warn!(error = %err, "job submission refused");
            IngressError::ShuttingDown
        })
}

/// `POST /ingest`: accept one webhook delivery.
pub async fn ingest(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return IngressError::InvalidPayload.into_response(),
    };
    if !payload.is_object() {
        return IngressError::InvalidPayload.into_response();
    }
    let Some(ticket_id) = extract_ticket_id(&payload) else {
        return IngressError::InvalidTicketId.into_response();
    };

    let ctx = JobContext {
        ticket_id,
        delivery_id: delivery_id(&headers),
        request_id: Some(request_id.0.clone()),
        webhook_user_login: webhook_user_login(&payload),
    };
    if let Err(err) = schedule(&state, ctx) {
        return err.into_response();
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"accepted": true, "ticket_id": ticket_id})),
    )
        .into_response()
}

/// `POST /ingest/batch`: accept an array of deliveries in one request.
///
/// Items are validated before anything is scheduled, so a bad item rejects
/// the whole batch. Batch items do not participate in delivery-id dedup.
pub async fn ingest_batch(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Bytes,
) -> Response {
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return IngressError::InvalidPayload.into_response(),
    };
    let Some(items) = payload.as_array() else {
        return IngressError::InvalidPayload.into_response();
    };

    let mut ticket_ids = Vec::with_capacity(items.len());
    for item in items {
        if !item.is_object() {
            return IngressError::InvalidPayload.into_response();
        }
        let Some(ticket_id) = extract_ticket_id(item) else {
            return IngressError::InvalidTicketId.into_response();
        };
        ticket_ids.push((ticket_id, webhook_user_login(item)));
    }

    let count = ticket_ids.len();
    for (ticket_id, user_login) in ticket_ids {
        let ctx = JobContext {
            ticket_id,
            delivery_id: None,
            request_id: Some(request_id.0.clone()),
            webhook_user_login: user_login,
        };
        if let Err(err) = schedule(&state, ctx) {
            return err.into_response();
        }
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"accepted": true, "count": count})),
    )
        .into_response()
}

/// `POST /retry/{ticket_id}`: schedule one job, bypassing delivery dedup.
pub async fn retry(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(ticket_id): Path<u64>,
) -> Response {
    if ticket_id == 0 {
        return IngressError::InvalidTicketId.into_response();
    }
    let ctx = JobContext {
        ticket_id,
        delivery_id: None,
        request_id: Some(request_id.0.clone()),
        webhook_user_login: None,
    };
    if let Err(err) = schedule(&state, ctx) {
        return err.into_response();
    }
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"accepted": true, "ticket_id": ticket_id})),
    )
        .into_response()
}

/// `GET /jobs/{ticket_id}`: process-local job status.
pub async fn job_status(
    State(state): State<AppState>,
    Path(ticket_id): Path<u64>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ticket_id": ticket_id,
        "in_flight": state.pipeline.in_flight().contains(ticket_id),
        "shutting_down": state.shutdown.is_shutting_down(),
    }))
}

/// `GET /healthz`: liveness.
pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut body = serde_json::json!({
        "status": "ok",
        "time": crate::audit::format_timestamp_utc(chrono::Utc::now()),
    });
    if !state.settings.observability.healthz_omit_version {
        body["service"] = serde_json::Value::String(crate::SERVICE_NAME.to_owned());
        body["version"] = serde_json::Value::String(crate::SERVICE_VERSION.to_owned());
    }
    Json(body)
}

/// `GET /metrics`: Prometheus text exposition, optionally bearer-guarded.
pub async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.settings.observability.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    if let Some(expected) = state.settings.observability.metrics_bearer_token.as_ref() {
        let expected = secrecy::ExposeSecret::expose_secret(expected).as_bytes();
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::as_bytes)
            .unwrap_or_default();
        if !bool::from(expected.ct_eq(provided)) {
            return IngressError::Unauthorized.into_response();
        }
    }

    match state.metrics.encode_text() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ticket_id_coercion_rules() {
        assert_eq!(coerce_ticket_id(&json!(123)), Some(123));
        assert_eq!(coerce_ticket_id(&json!("123")), Some(123));
        assert_eq!(coerce_ticket_id(&json!(" +123 ")), Some(123));

        assert_eq!(coerce_ticket_id(&json!(true)), None);
        assert_eq!(coerce_ticket_id(&json!(false)), None);
        assert_eq!(coerce_ticket_id(&json!(0)), None);
        assert_eq!(coerce_ticket_id(&json!(-5)), None);
        assert_eq!(coerce_ticket_id(&json!(1.5)), None);
        assert_eq!(coerce_ticket_id(&json!("12a")), None);
        assert_eq!(coerce_ticket_id(&json!("")), None);
        assert_eq!(coerce_ticket_id(&json!(null)), None);
        assert_eq!(coerce_ticket_id(&json!({"id": 1})), None);
    }

    #[test]
    fn ticket_id_extraction_prefers_the_ticket_object() {
        assert_eq!(
            extract_ticket_id(&json!({"ticket": {"id": 7}, "ticket_id": 9})),
            Some(7)
        );
        assert_eq!(extract_ticket_id(&json!({"ticket_id": 9})), Some(9));
        assert_eq!(extract_ticket_id(&json!({"ticket": {"id": true}})), None);
        assert_eq!(extract_ticket_id(&json!({})), None);
    }

    #[test]
    fn user_login_extraction() {
        assert_eq!(
            webhook_user_login(&json!({"user": {"login": " agent "}})),
            Some("agent".to_owned())
        );
        assert_eq!(webhook_user_login(&json!({"user": {"login": ""}})), None);
        assert_eq!(webhook_user_login(&json!({"user": 5})), None);
        assert_eq!(webhook_user_login(&json!({})), None);
    }
}
