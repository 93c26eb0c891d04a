//! Async client for the TMS REST API.
//!
//! The client covers exactly the six operations the orchestrator needs:
//! fetch ticket/tags/articles, add/remove a tag, and post an internal note.
//! Each call has a per-request timeout. Individual calls are **not**
//! retried here - failures surface to the orchestrator, which classifies
//! them once and decides the ticket-side outcome.
//!
//! # Transport safety
//!
//! Enforced at construction, before any request leaves the process:
//! plaintext URLs, disabled TLS verification, and loopback/link-local
//! upstreams are rejected unless the matching hardening override is set.
//! The ambient proxy environment is not honoured by default.

pub mod models;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use url::{Host, Url};

use crate::error::{ErrorCode, JobError};
use models::{TmsArticle, TmsTagResponse, TmsTicket};

/// Errors from the TMS client.
#[derive(Debug, Error)]
pub enum TmsError {
    /// Authentication or authorisation failure (HTTP 401/403).
    #[error("TMS auth failed (status={status}) at {url}")]
    Auth {
        /// HTTP status.
        status: u16,
        /// Request URL.
        url: String,
    },

    /// The resource does not exist (HTTP 404).
    #[error("TMS resource not found at {url}")]
    NotFound {
        /// Request URL.
        url: String,
    },

    /// The TMS rate-limited the request (HTTP 429).
    #[error("TMS rate limit (status=429) at {url}")]
    RateLimited {
        /// Request URL.
        url: String,
    },

    /// Server-side failure (HTTP 5xx).
    #[error("TMS server error (status={status}) at {url}")]
    Server {
        /// HTTP status.
        status: u16,
        /// Request URL.
        url: String,
    },

    /// Any other client error (HTTP 4xx).
    #[error("TMS client error (status={status}) at {url}")]
    Client {
        /// HTTP status.
        status: u16,
        /// Request URL.
        url: String,
    },

    /// The request timed out.
    #[error("TMS request timed out at {url}")]
    Timeout {
        /// Request URL.
        url: String,
    },

    /// Connection-level failure (reset, DNS, TLS handshake).
    #[error("TMS transport error: {0}")]
    Transport(String),

    /// The response body could not be decoded.
    #[error("invalid TMS response at {url}: {message}")]
    Decode {
        /// Request URL.
        url: String,
        /// Decode failure description.
        message: String,
    },

    /// The client configuration is unusable.
    #[error("TMS client configuration error: {0}")]
    Config(String),
}

impl From<TmsError> for JobError {
    fn from(err: TmsError) -> Self {
        match &err {
            TmsError::Timeout { .. } => Self::transient(ErrorCode::TmsTimeout, err.to_string()),
            TmsError::Transport(_) | TmsError::Server { .. } | TmsError::RateLimited { .. } => {
                Self::transient(ErrorCode::TmsServer, err.to_string())
            },
            TmsError::Auth { .. } => Self::permanent(ErrorCode::TmsAuth, err.to_string()),
            TmsError::NotFound { .. } => Self::permanent(ErrorCode::TmsNotFound, err.to_string()),
            TmsError::Client { .. } | TmsError::Decode { .. } => {
                Self::permanent(ErrorCode::TmsServer, err.to_string())
            },
            TmsError::Config(_) => Self::permanent(ErrorCode::Unknown, err.to_string()),
        }
    }
}

/// Transport hardening overrides (all default to the safe side).
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportHardening {
    /// Honour `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY`.
    pub trust_env: bool,
    /// Allow plaintext `http://` upstreams.
    pub allow_insecure_http: bool,
    /// Allow disabling TLS certificate verification.
    pub allow_insecure_tls: bool,
    /// Allow loopback / link-local upstream hosts.
    pub allow_local_upstreams: bool,
}

/// Validates an upstream base URL against the transport hardening policy.
///
/// # Errors
///
/// Returns [`TmsError::Config`] for plaintext schemes or local upstreams
/// without the matching override.
pub fn validate_upstream_url(raw: &str, hardening: TransportHardening) -> Result<Url, TmsError> {
    let url = Url::parse(raw).map_err(|err| TmsError::Config(format!("invalid base URL: {err}")))?;

    match url.scheme() {
        "https" => {},
        "http" if hardening.allow_insecure_http => {},
        "http" => {
            return Err(TmsError::Config(
                "plaintext http upstream rejected (set transport.allow_insecure_http to override)"
                    .to_owned(),
            ));
        },
        other => {
            return Err(TmsError::Config(format!(
                "unsupported upstream scheme: {other}"
            )));
        },
    }

    if !hardening.allow_local_upstreams {
        let local = match url.host() {
            Some(Host::Ipv4(ip)) => ip.is_loopback() || ip.is_link_local() || ip.is_unspecified(),
            Some(Host::Ipv6(ip)) => {
                ip.is_loopback() || ip.is_unspecified() || (ip.segments()[0] & 0xffc0) == 0xfe80
            },
            Some(Host::Domain(domain)) => {
                let domain = domain.to_ascii_lowercase();
                domain == "localhost"
                    || domain.ends_with(".localhost")
                    || domain.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
            },
            None => true,
        };
        if local {
            return Err(TmsError::Config(
                "loopback/link-local upstream rejected (set transport.allow_local_upstreams to override)"
                    .to_owned(),
            ));
        }
    }

    Ok(url)
}

/// The six ticket operations used by the orchestrator. The trait seam
/// exists so orchestrator tests can run against an in-memory TMS.
#[async_trait]
pub trait TicketApi: Send + Sync {
    /// Fetches a ticket.
    async fn get_ticket(&self, ticket_id: u64) -> Result<TmsTicket, TmsError>;

    /// Lists the ticket's tags.
    async fn list_tags(&self, ticket_id: u64) -> Result<Vec<String>, TmsError>;

    /// Lists the ticket's articles.
    async fn list_articles(&self, ticket_id: u64) -> Result<Vec<TmsArticle>, TmsError>;

    /// Adds a tag to the ticket.
    async fn add_tag(&self, ticket_id: u64, tag: &str) -> Result<(), TmsError>;

    /// Removes a tag from the ticket.
    async fn remove_tag(&self, ticket_id: u64, tag: &str) -> Result<(), TmsError>;

    /// Posts an internal HTML note on the ticket.
    async fn create_internal_note(
        &self,
        ticket_id: u64,
        subject: &str,
        body_html: &str,
    ) -> Result<(), TmsError>;
}

/// Reqwest-backed TMS client.
#[derive(Debug)]
pub struct TmsClient {
    base_url: Url,
    token: SecretString,
    http: reqwest::Client,
}

impl TmsClient {
    /// Builds a client against the given base URL.
    ///
    /// # Errors
    ///
    /// Returns [`TmsError::Config`] when the URL violates the transport
    /// policy or the HTTP client cannot be constructed.
    pub fn new(
        base_url: &str,
        token: SecretString,
        timeout: Duration,
        verify_tls: bool,
        hardening: TransportHardening,
    ) -> Result<Self, TmsError> {
        let mut url = validate_upstream_url(base_url, hardening)?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        if !verify_tls && !hardening.allow_insecure_tls {
            return Err(TmsError::Config(
                "disabled TLS verification rejected (set transport.allow_insecure_tls to override)"
                    .to_owned(),
            ));
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5).min(timeout))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!verify_tls);
        if !hardening.trust_env {
            builder = builder.no_proxy();
        }
        let http = builder
            .build()
            .map_err(|err| TmsError::Config(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            base_url: url,
            token,
            http,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TmsError> {
        self.base_url
            .join(path)
            .map_err(|err| TmsError::Config(format!("invalid endpoint {path}: {err}")))
    }

    fn map_send_error(err: &reqwest::Error, url: &Url) -> TmsError {
        if err.is_timeout() {
            TmsError::Timeout {
                url: url.to_string(),
            }
        } else {
            TmsError::Transport(err.to_string())
        }
    }

    fn status_error(status: StatusCode, url: &Url) -> TmsError {
        let url = url.to_string();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TmsError::Auth {
                status: status.as_u16(),
                url,
            },
            StatusCode::NOT_FOUND => TmsError::NotFound { url },
            StatusCode::TOO_MANY_REQUESTS => TmsError::RateLimited { url },
            status if status.is_server_error() => TmsError::Server {
                status: status.as_u16(),
                url,
            },
            status => TmsError::Client {
                status: status.as_u16(),
                url,
            },
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, TmsError> {
        let url = self.endpoint(path)?;
        let response = self
            .http
            .get(url.clone())
            .header("Accept", "application/json")
            .header(
                "Authorization",
                format!("Token token={}", self.token.expose_secret()),
            )
            .send()
            .await
            .map_err(|err| Self::map_send_error(&err, &url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::status_error(status, &url));
        }
        response.json::<T>().await.map_err(|err| TmsError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<(), TmsError> {
        let url = self.endpoint(path)?;
        let response = self
            .http
            .post(url.clone())
            .header("Accept", "application/json")
            .header(
                "Authorization",
                format!("Token token={}", self.token.expose_secret()),
            )
            .json(body)
            .send()
            .await
            .map_err(|err| Self::map_send_error(&err, &url))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::status_error(status, &url))
        }
    }
}

#[async_trait]
impl TicketApi for TmsClient {
    async fn get_ticket(&self, ticket_id: u64) -> Result<TmsTicket, TmsError> {
        self.get_json(&format!("api/v1/tickets/{ticket_id}")).await
    }

    async fn list_tags(&self, ticket_id: u64) -> Result<Vec<String>, TmsError> {
        let response: TmsTagResponse = self
            .get_json(&format!("api/v1/tags?object=Ticket&o_id={ticket_id}"))
            .await?;
        Ok(response.into_tags())
    }

    async fn list_articles(&self, ticket_id: u64) -> Result<Vec<TmsArticle>, TmsError> {
        self.get_json(&format!("api/v1/ticket_articles/by_ticket/{ticket_id}"))
            .await
    }

    async fn add_tag(&self, ticket_id: u64, tag: &str) -> Result<(), TmsError> {
        self.post_json(
            "api/v1/tags/add",
            &serde_json::json!({"object": "Ticket", "o_id": ticket_id, "item": tag}),
        )
        .await
    }

    async fn remove_tag(&self, ticket_id: u64, tag: &str) -> Result<(), TmsError> {
        // Some deployments are strict about verb routing for tags; POST
        // matches the documented tags/remove endpoint everywhere.
        self.post_json(
            "api/v1/tags/remove",
            &serde_json::json!({"object": "Ticket", "o_id": ticket_id, "item": tag}),
        )
        .await
    }

    async fn create_internal_note(
        &self,
        ticket_id: u64,
        subject: &str,
        body_html: &str,
    ) -> Result<(), TmsError> {
        self.post_json(
            "api/v1/ticket_articles",
            &serde_json::json!({
                "ticket_id": ticket_id,
                "subject": subject,
                "body": body_html,
                "content_type": "text/html",
                "internal": true,
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str, hardening: TransportHardening) -> Result<TmsClient, TmsError> {
        TmsClient::new(
            url,
            SecretString::from("test-token"),
            Duration::from_secs(10),
            true,
            hardening,
        )
    }

    #[test]
    fn rejects_plaintext_without_override() {
        let err = client("http://tms.example", TransportHardening::default()).unwrap_err();
        assert!(matches!(err, TmsError::Config(_)));

        let hardening = TransportHardening {
            allow_insecure_http: true,
            ..Default::default()
        };
        assert!(client("http://tms.example", hardening).is_ok());
    }

    #[test]
    fn rejects_local_upstreams_without_override() {
        for url in [
            "https://localhost",
            "https://127.0.0.1",
            "https://[::1]",
            "https://169.254.1.1",
        ] {
            let err = client(url, TransportHardening::default()).unwrap_err();
            assert!(matches!(err, TmsError::Config(_)), "accepted {url}");
        }

        let hardening = TransportHardening {
            allow_local_upstreams: true,
            ..Default::default()
        };
        assert!(client("https://127.0.0.1", hardening).is_ok());
    }

    #[test]
    fn rejects_disabled_tls_verification_without_override() {
        let err = TmsClient::new(
            "https://tms.example",
            SecretString::from("t"),
            Duration::from_secs(10),
            false,
            TransportHardening::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TmsError::Config(_)));
    }

    #[test]
    fn status_mapping_follows_the_classifier_rules() {
        let url = Url::parse("https://tms.example/api/v1/tickets/1").unwrap();

        let auth = TmsClient::status_error(StatusCode::UNAUTHORIZED, &url);
        assert_eq!(JobError::from(auth).code(), Some(ErrorCode::TmsAuth));

        let missing = TmsClient::status_error(StatusCode::NOT_FOUND, &url);
        let missing = JobError::from(missing);
        assert_eq!(missing.code(), Some(ErrorCode::TmsNotFound));
        assert!(!missing.keep_trigger());

        let server = TmsClient::status_error(StatusCode::BAD_GATEWAY, &url);
        let server = JobError::from(server);
        assert_eq!(server.code(), Some(ErrorCode::TmsServer));
        assert!(server.keep_trigger());

        let rate = TmsClient::status_error(StatusCode::TOO_MANY_REQUESTS, &url);
        assert!(JobError::from(rate).keep_trigger());

        let client_err = TmsClient::status_error(StatusCode::UNPROCESSABLE_ENTITY, &url);
        assert!(!JobError::from(client_err).keep_trigger());
    }

    #[test]
    fn timeout_maps_to_transient_tms_timeout() {
        let err = TmsError::Timeout {
            url: "https://tms.example/api".to_owned(),
        };
        let job = JobError::from(err);
        assert_eq!(job.code(), Some(ErrorCode::TmsTimeout));
        assert!(job.keep_trigger());
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let client = client("https://tms.example/sub", TransportHardening::default()).unwrap();
        let endpoint = client.endpoint("api/v1/tickets/7").unwrap();
        assert_eq!(endpoint.as_str(), "https://tms.example/sub/api/v1/tickets/7");
    }
}
