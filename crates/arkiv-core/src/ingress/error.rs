//! Canonical ingress error responses.
//!
//! Every HTTP-layer rejection short-circuits with a `{"detail": <slug>}`
//! body and never enters the orchestrator. The slugs are part of the wire
//! contract; messages never carry request content or internal detail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// HTTP-layer rejections for the ingress surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngressError {
    /// `X-Delivery-Id` is required but missing or blank.
    #[error("missing delivery id")]
    MissingDeliveryId,

    /// Signature missing, malformed, or wrong; or the client disconnected
    /// before the body completed.
    #[error("forbidden")]
    Forbidden,

    /// The request body exceeds the configured cap.
    #[error("request too large")]
    RequestTooLarge,

    /// The payload is not valid JSON of the expected shape.
    #[error("invalid payload")]
    InvalidPayload,

    /// The ticket id is missing, non-positive, or of the wrong type.
    #[error("invalid ticket id")]
    InvalidTicketId,

    /// The client exceeded the rate limit.
    #[error("rate limited")]
    RateLimited,

    /// No webhook secret is configured and unsigned ingest is not allowed.
    #[error("webhook auth not configured")]
    AuthNotConfigured,

    /// The service is draining or at capacity.
    #[error("shutting down")]
    ShuttingDown,

    /// `/metrics` is protected and the bearer token did not match.
    #[error("unauthorized")]
    Unauthorized,
}

impl IngressError {
    /// The response status code.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingDeliveryId => StatusCode::BAD_REQUEST,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidPayload | Self::InvalidTicketId => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::AuthNotConfigured | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// The stable body slug.
    #[must_use]
    pub const fn detail(&self) -> &'static str {
        match self {
            Self::MissingDeliveryId => "missing_delivery_id",
            Self::Forbidden => "forbidden",
            Self::Unauthorized => "unauthorized",
            Self::RequestTooLarge => "request_too_large",
            Self::InvalidPayload => "invalid_payload",
            Self::InvalidTicketId => "invalid_ticket_id",
            Self::RateLimited => "rate_limited",
            Self::AuthNotConfigured => "webhook_auth_not_configured",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(serde_json::json!({"detail": self.detail()})),
        )
            .into_response()
    }
}
