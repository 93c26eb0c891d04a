//! The ingress middleware chain.
//!
//! Mounted outermost first: request-id, body-size limit, rate limit, HMAC
//! verification (ingest paths only), delivery-id requirement. The chain
//! runs entirely before the `202` acknowledgement, so signature and size
//! enforcement always complete before a job is scheduled.
//!
//! The body-size middleware buffers the (bounded) body and reinstates it
//! on the request, which gives the HMAC verifier the exact bytes the
//! signature was computed over and guarantees the body is fully drained
//! before any rejection is written.

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::error::IngressError;
use super::AppState;

/// Request-id header name.
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Signature header name.
pub const SIGNATURE_HEADER: &str = "x-hub-signature";
/// Delivery-id header name.
pub const DELIVERY_ID_HEADER: &str = "x-delivery-id";

/// The request id attached to the request context.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

fn is_valid_request_id(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() <= 128
        && candidate
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | ':' | '-'))
}

fn ingest_path(path: &str) -> bool {
    path == "/ingest" || path == "/ingest/batch"
}

/// Reads or mints the request id, sticks it on the request context, and
/// echoes it on the response.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|candidate| is_valid_request_id(candidate))
        .map(ToOwned::to_owned);
    let request_id = provided.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Streams the body with a running byte count, rejects over-cap requests
/// with 413, and reinstates the buffered bytes for downstream layers.
pub async fn body_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let max_bytes = state.settings.hardening.body_limit.max_bytes;
    if max_bytes == 0 || !request.uri().path().starts_with("/ingest") {
        return next.run(request).await;
    }

    // Advisory pre-check; the streaming count below is authoritative.
    if let Some(length) = request
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
    {
        if length > max_bytes {
            return IngressError::RequestTooLarge.into_response();
        }
    }

    let (parts, body) = request.into_parts();
    let mut body = body;
    let mut buffered: Vec<u8> = Vec::new();
    loop {
        match body.frame().await {
            None => break,
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    if buffered.len() + data.len() > max_bytes {
                        return IngressError::RequestTooLarge.into_response();
                    }
                    buffered.extend_from_slice(data);
                }
            },
            // A failed read means the client went away mid-body; never
            // trust a partial body.
            Some(Err(_)) => return IngressError::Forbidden.into_response(),
        }
    }

    let request = Request::from_parts(parts, Body::from(buffered));
    next.run(request).await
}

/// Applies the token-bucket limiter to ingest and retry paths.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let config = &state.settings.hardening.rate_limit;
    let path = request.uri().path();
    if !config.enabled || !(path.starts_with("/ingest") || path.starts_with("/retry/")) {
        return next.run(request).await;
    }

    let key = client_key(&request, config.client_key_header.as_deref());
    if state.limiter.allow(&key) {
        next.run(request).await
    } else {
        tracing::warn!(client = %key, path, "rate limit exceeded");
        IngressError::RateLimited.into_response()
    }
}

fn client_key(request: &Request, header: Option<&str>) -> String {
    if let Some(header_name) = header {
        if let Some(value) = request
            .headers()
            .get(header_name)
            .and_then(|value| value.to_str().ok())
        {
            let first = value.split(',').next().unwrap_or_default().trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<std::net::SocketAddr>>()
        .map_or_else(|| "unknown".to_owned(), |info| info.0.ip().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignatureAlgorithm {
    Sha1,
    Sha256,
}

fn parse_signature(raw: &str) -> Option<(SignatureAlgorithm, Vec<u8>)> {
    let (algorithm, hex_digest) = raw.trim().split_once('=')?;
    let algorithm = match algorithm.trim().to_ascii_lowercase().as_str() {
        "sha1" => SignatureAlgorithm::Sha1,
        "sha256" => SignatureAlgorithm::Sha256,
        _ => return None,
    };
    let digest = hex::decode(hex_digest.trim()).ok()?;
    let expected_len = match algorithm {
        SignatureAlgorithm::Sha1 => 20,
        SignatureAlgorithm::Sha256 => 32,
    };
    (digest.len() == expected_len).then_some((algorithm, digest))
}

fn compute_hmac(algorithm: SignatureAlgorithm, secret: &[u8], body: &[u8]) -> Vec<u8> {
    match algorithm {
        SignatureAlgorithm::Sha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(secret).expect("hmac accepts any key length");
            mac.update(body);
            mac.finalize().into_bytes().to_vec()
        },
        SignatureAlgorithm::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
            mac.update(body);
            mac.finalize().into_bytes().to_vec()
        },
    }
}

/// Verifies the webhook signature over the exact buffered body bytes, then
/// enforces the optional delivery-id requirement. Ingest paths only.
pub async fn hmac_verify(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !ingest_path(request.uri().path()) || request.method() != &axum::http::Method::POST {
        return next.run(request).await;
    }

    let secret = state
        .settings
        .tms
        .webhook_secret
        .as_ref()
        .map(|secret| secrecy::ExposeSecret::expose_secret(secret).as_bytes().to_vec())
        .filter(|secret| !secret.is_empty());

    let verified = match secret {
        None => {
            if !state.settings.hardening.webhook.allow_unsigned {
                // Fail closed: running without webhook auth is almost
                // always a production footgun.
                return IngressError::AuthNotConfigured.into_response();
            }
            None
        },
        Some(secret) => Some(secret),
    };

    let (parts, body) = request.into_parts();
    let body_bytes: Bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return IngressError::Forbidden.into_response(),
    };

    if let Some(secret) = verified {
        let Some(signature_raw) = parts
            .headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
        else {
            return IngressError::Forbidden.into_response();
        };
        let Some((algorithm, provided)) = parse_signature(signature_raw) else {
            return IngressError::Forbidden.into_response();
        };
        let expected = compute_hmac(algorithm, &secret, &body_bytes);
        if !bool::from(expected.ct_eq(&provided)) {
            return IngressError::Forbidden.into_response();
        }
    }

    if state.settings.hardening.webhook.require_delivery_id
        && parts.uri.path() == "/ingest"
        && parts
            .headers
            .get(DELIVERY_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map_or(true, |value| value.trim().is_empty())
    {
        return IngressError::MissingDeliveryId.into_response();
    }

    let request = Request::from_parts(parts, Body::from(body_bytes));
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_validation_rules() {
        assert!(is_valid_request_id("req-1.2:3_x"));
        assert!(!is_valid_request_id(""));
        assert!(!is_valid_request_id("has space"));
        assert!(!is_valid_request_id(&"x".repeat(129)));
    }

    #[test]
    fn signature_parsing_accepts_both_algorithms() {
        let (algorithm, digest) = parse_signature(&format!("sha256={}", "ab".repeat(32))).unwrap();
        assert_eq!(algorithm, SignatureAlgorithm::Sha256);
        assert_eq!(digest.len(), 32);

        let (algorithm, digest) = parse_signature(&format!("SHA1={}", "cd".repeat(20))).unwrap();
        assert_eq!(algorithm, SignatureAlgorithm::Sha1);
        assert_eq!(digest.len(), 20);
    }

    #[test]
    fn signature_parsing_rejects_malformed_values() {
        assert!(parse_signature("md5=abcd").is_none());
        assert!(parse_signature("sha256").is_none());
        assert!(parse_signature("sha256=zz").is_none());
        // Digest length must match the declared algorithm.
        assert!(parse_signature(&format!("sha256={}", "ab".repeat(20))).is_none());
        assert!(parse_signature(&format!("sha1={}", "ab".repeat(32))).is_none());
    }

    #[test]
    fn hmac_matches_reference_vectors() {
        // RFC 2202 test case 2 (HMAC-SHA1), key "Jefe".
        let digest = compute_hmac(
            SignatureAlgorithm::Sha1,
            b"Jefe",
            b"what do ya want for nothing?",
        );
        assert_eq!(hex::encode(digest), "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");

        // RFC 4231 test case 2 (HMAC-SHA256).
        let digest = compute_hmac(
            SignatureAlgorithm::Sha256,
            b"Jefe",
            b"what do ya want for nothing?",
        );
        assert_eq!(
            hex::encode(digest),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn ingest_path_filter() {
        assert!(ingest_path("/ingest"));
        assert!(ingest_path("/ingest/batch"));
        assert!(!ingest_path("/healthz"));
        assert!(!ingest_path("/retry/42"));
    }
}
