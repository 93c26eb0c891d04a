//! RFC3161 timestamp authority client.
//!
//! One operation: [`TsaClient::stamp`] sends a `TimeStampReq` for a SHA-256
//! message imprint and returns the DER `TimeStampToken`. The exchange is
//! strict:
//!
//! - the request goes out as `application/timestamp-query`
//! - only HTTP 200 with content-type `application/timestamp-reply` is
//!   accepted (5xx is transient, anything else is permanent)
//! - the response must be a structurally valid `TimeStampResp` with status
//!   `granted`/`grantedWithMods` and a present token whose content type is
//!   id-signedData
//!
//! Basic auth is all-or-nothing: user without password (or vice versa) is a
//! misconfiguration, caught at construction.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::error::{ErrorCode, JobError};
use crate::signing::der;
use crate::tms::{TransportHardening, validate_upstream_url};

const CONTENT_TYPE_QUERY: &str = "application/timestamp-query";
const CONTENT_TYPE_REPLY: &str = "application/timestamp-reply";

/// id-signedData: 1.2.840.113549.1.7.2
const OID_SIGNED_DATA: &[u64] = &[1, 2, 840, 113_549, 1, 7, 2];
/// SHA-256: 2.16.840.1.101.3.4.2.1
const OID_SHA256: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 1];

/// Errors from the TSA exchange.
#[derive(Debug, Error)]
pub enum TsaError {
    /// The TSA did not answer within the timeout.
    #[error("TSA request timed out")]
    Timeout,

    /// Connection-level failure.
    #[error("TSA transport error: {0}")]
    Transport(String),

    /// The TSA answered with a server error (retryable).
    #[error("TSA returned HTTP {0}")]
    ServerError(u16),

    /// The TSA answered with a non-200, non-5xx status.
    #[error("TSA returned HTTP {0}, expected 200")]
    UnexpectedStatus(u16),

    /// The response carried the wrong content type.
    #[error("TSA response has unexpected content type {0:?}")]
    BadContentType(String),

    /// The response body is not a valid timestamp response.
    #[error("TSA response is malformed: {0}")]
    BadResponse(String),

    /// The TSA configuration is unusable.
    #[error("TSA misconfigured: {0}")]
    Misconfigured(String),
}

impl From<TsaError> for JobError {
    fn from(err: TsaError) -> Self {
        match &err {
            TsaError::Timeout | TsaError::Transport(_) | TsaError::ServerError(_) => {
                Self::transient(ErrorCode::TsaTimeout, err.to_string())
            },
            TsaError::UnexpectedStatus(_)
            | TsaError::BadContentType(_)
            | TsaError::BadResponse(_) => Self::permanent(ErrorCode::TsaBadResponse, err.to_string()),
            TsaError::Misconfigured(_) => {
                Self::permanent(ErrorCode::TsaMisconfigured, err.to_string())
            },
        }
    }
}

/// Optional HTTP basic auth for the TSA endpoint.
#[derive(Clone, Debug)]
pub struct TsaBasicAuth {
    /// Username.
    pub user: String,
    /// Password.
    pub password: SecretString,
}

/// RFC3161 client for one TSA endpoint.
#[derive(Debug)]
pub struct TsaClient {
    url: url::Url,
    auth: Option<TsaBasicAuth>,
    http: reqwest::Client,
}

impl TsaClient {
    /// Builds a client for the endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TsaError::Misconfigured`] for a bad URL, a partial basic
    /// auth pair, or an unusable HTTP client configuration.
    pub fn new(
        tsa_url: &str,
        timeout: Duration,
        user: Option<String>,
        password: Option<SecretString>,
        hardening: TransportHardening,
    ) -> Result<Self, TsaError> {
        let url = validate_upstream_url(tsa_url, hardening)
            .map_err(|err| TsaError::Misconfigured(err.to_string()))?;

        let auth = match (user, password) {
            (Some(user), Some(password)) if !user.is_empty() => {
                Some(TsaBasicAuth { user, password })
            },
            (None, None) => None,
            _ => {
                return Err(TsaError::Misconfigured(
                    "basic auth requires both user and password, or neither".to_owned(),
                ));
            },
        };

        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5).min(timeout))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none());
        if !hardening.trust_env {
            builder = builder.no_proxy();
        }
        let http = builder
            .build()
            .map_err(|err| TsaError::Misconfigured(format!("failed to build HTTP client: {err}")))?;

        Ok(Self { url, auth, http })
    }

    /// Requests a timestamp token over a SHA-256 message imprint.
    ///
    /// # Errors
    ///
    /// See the module documentation for the transient/permanent split.
    pub async fn stamp(&self, message_imprint_sha256: &[u8; 32]) -> Result<Vec<u8>, TsaError> {
        let request_der = build_timestamp_request(message_imprint_sha256, nonce());

        let mut request = self
            .http
            .post(self.url.clone())
            .header("Content-Type", CONTENT_TYPE_QUERY)
            .header("Accept", CONTENT_TYPE_REPLY)
            .body(request_der);
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.user, Some(auth.password.expose_secret()));
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                TsaError::Timeout
            } else {
                TsaError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TsaError::ServerError(status.as_u16()));
        }
        if status != reqwest::StatusCode::OK {
            return Err(TsaError::UnexpectedStatus(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
            .unwrap_or_default();
        if content_type != CONTENT_TYPE_REPLY {
            return Err(TsaError::BadContentType(content_type));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| TsaError::Transport(err.to_string()))?;
        extract_timestamp_token(&body)
    }
}

fn nonce() -> [u8; 8] {
    let uuid = uuid::Uuid::new_v4();
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&uuid.as_bytes()[..8]);
    nonce
}

/// Assembles the DER `TimeStampReq`.
#[must_use]
pub fn build_timestamp_request(message_imprint_sha256: &[u8; 32], nonce: [u8; 8]) -> Vec<u8> {
    let algorithm = der::sequence(&[&der::oid(OID_SHA256), &der::null()]);
    let message_imprint =
        der::sequence(&[&algorithm, &der::octet_string(message_imprint_sha256)]);
    der::sequence(&[
        &der::integer_u64(1),
        &message_imprint,
        &der::integer(&nonce),
        &der::boolean(true),
    ])
}

/// Validates a `TimeStampResp` and extracts the `TimeStampToken` DER.
///
/// # Errors
///
/// Returns [`TsaError::BadResponse`] for any structural violation: bad
/// outer framing, a non-granted status, or a missing/ill-typed token.
pub fn extract_timestamp_token(response: &[u8]) -> Result<Vec<u8>, TsaError> {
    let bad = |message: &str| TsaError::BadResponse(message.to_owned());

    let (outer, trailing) =
        der::expect_element(response, der::TAG_SEQUENCE).map_err(|err| bad(&err.to_string()))?;
    if !trailing.is_empty() {
        return Err(bad("trailing bytes after TimeStampResp"));
    }

    // PKIStatusInfo ::= SEQUENCE { status INTEGER, ... }
    let (status_info, token_bytes) =
        der::expect_element(outer.content, der::TAG_SEQUENCE).map_err(|err| bad(&err.to_string()))?;
    let (status, _) = der::expect_element(status_info.content, der::TAG_INTEGER)
        .map_err(|err| bad(&err.to_string()))?;
    let granted = matches!(status.content, [0] | [1]);
    if !granted {
        return Err(bad("TSA status is not granted"));
    }

    if token_bytes.is_empty() {
        return Err(bad("TimeStampResp carries no token"));
    }

    // TimeStampToken ::= ContentInfo { contentType id-signedData, ... }
    let (token, trailing) =
        der::expect_element(token_bytes, der::TAG_SEQUENCE).map_err(|err| bad(&err.to_string()))?;
    if !trailing.is_empty() {
        return Err(bad("trailing bytes after TimeStampToken"));
    }
    let (content_type, _) =
        der::expect_element(token.content, der::TAG_OID).map_err(|err| bad(&err.to_string()))?;
    let expected = der::oid(OID_SIGNED_DATA);
    let (expected_oid, _) = der::read_element(&expected).map_err(|err| bad(&err.to_string()))?;
    if content_type.content != expected_oid.content {
        return Err(bad("token content type is not id-signedData"));
    }

    Ok(token_bytes.to_vec())
}
