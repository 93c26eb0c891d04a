//! The HTTP ingress: router, state, and middleware chain.
//!
//! The chain is mounted outermost first - request-id, body-size limit,
//! rate limit, HMAC verification, delivery-id requirement - so signature
//! and size enforcement always complete before the `202` acknowledgement.
//! Endpoints beyond `/ingest` bypass HMAC and the delivery-id requirement
//! but stay subject to the earlier layers where applicable.

pub mod error;
pub mod middleware;
pub mod rate_limit;
pub mod routes;

use std::sync::Arc;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use thiserror::Error;

use crate::config::Settings;
use crate::idempotency::{DeliveryRegistry, InFlightSet};
use crate::metrics::{Metrics, MetricsError};
use crate::pipeline::dispatcher::{InProcessExecutor, JobExecutor, ShutdownState};
use crate::pipeline::{Pipeline, PipelineParts};
use crate::redact::SecretRedactor;
use crate::render::TextPdfRenderer;
use crate::signing::{Signer, SigningError, SigningMaterial};
use crate::snapshot::AllowlistSanitizer;
use crate::tms::{TicketApi, TmsClient, TmsError};
use crate::tsa::{TsaClient, TsaError};
use rate_limit::TokenBucketLimiter;

pub use error::IngressError;

/// A component failed to construct at startup.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The TMS client rejected its configuration.
    #[error(transparent)]
    Tms(#[from] TmsError),

    /// Signing material could not be loaded.
    #[error(transparent)]
    Signing(#[from] SigningError),

    /// The TSA client rejected its configuration.
    #[error(transparent)]
    Tsa(#[from] TsaError),

    /// Metrics registration failed.
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// Shared state behind every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration.
    pub settings: Arc<Settings>,
    /// The processing orchestrator.
    pub pipeline: Arc<Pipeline>,
    /// Background job executor.
    pub executor: Arc<dyn JobExecutor>,
    /// Ingress rate limiter.
    pub limiter: Arc<TokenBucketLimiter>,
    /// Metric families.
    pub metrics: Metrics,
    /// Shutdown flags.
    pub shutdown: ShutdownState,
}

impl AppState {
    /// Builds the full production state: real TMS client, signer and TSA
    /// client when configured, in-process executor.
    ///
    /// A missing PFX, a wrong password, or an unsafe upstream URL stops
    /// the process before it accepts a single webhook.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError`] when any component refuses its
    /// configuration.
    pub fn from_settings(settings: Arc<Settings>) -> Result<Self, SetupError> {
        let hardening = settings.hardening.transport.hardening();
        let tms: Arc<dyn TicketApi> = Arc::new(TmsClient::new(
            &settings.tms.base_url,
            settings.tms.api_token.clone(),
            settings.tms.timeout(),
            settings.tms.verify_tls,
            hardening,
        )?);

        let signer = if settings.signing.enabled {
            let pfx_path = settings.signing.pfx_path.as_ref().ok_or_else(|| {
                SigningError::Material("signing is enabled but signing.pfx_path is not set".into())
            })?;
            let material = SigningMaterial::load(pfx_path, settings.signing.pfx_password.as_ref())?;
            Some(Arc::new(Signer::new(material)))
        } else {
            None
        };

        let tsa = if settings.signing.timestamp.enabled {
            let timestamp = &settings.signing.timestamp;
            let tsa_url = timestamp.tsa_url.as_deref().ok_or_else(|| {
                TsaError::Misconfigured("timestamping is enabled but tsa_url is not set".into())
            })?;
            Some(Arc::new(TsaClient::new(
                tsa_url,
                timestamp.timeout(),
                timestamp.user.clone(),
                timestamp.password.clone(),
                hardening,
            )?))
        } else {
            None
        };

        let shutdown = ShutdownState::new();
        let executor: Arc<dyn JobExecutor> = Arc::new(InProcessExecutor::new(
            settings.workflow.max_concurrency,
            shutdown.clone(),
        ));
        Self::assemble(settings, tms, signer, tsa, executor, shutdown)
    }

    /// Assembles the state from pre-built components (the test seam).
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::Metrics`] when metric registration fails.
    pub fn assemble(
        settings: Arc<Settings>,
        tms: Arc<dyn TicketApi>,
        signer: Option<Arc<Signer>>,
        tsa: Option<Arc<TsaClient>>,
        executor: Arc<dyn JobExecutor>,
        shutdown: ShutdownState,
    ) -> Result<Self, SetupError> {
        let metrics = Metrics::new()?;
        let limiter = Arc::new(TokenBucketLimiter::new(
            settings.hardening.rate_limit.rps,
            settings.hardening.rate_limit.burst,
        ));
        let pipeline = Arc::new(Pipeline::new(PipelineParts {
            settings: Arc::clone(&settings),
            tms,
            renderer: Arc::new(TextPdfRenderer),
            sanitizer: Arc::new(AllowlistSanitizer),
            signer,
            tsa,
            deliveries: Arc::new(DeliveryRegistry::new(settings.workflow.delivery_id_ttl())),
            in_flight: InFlightSet::new(),
            metrics: metrics.clone(),
            redactor: Arc::new(SecretRedactor::new()),
            shutdown: shutdown.clone(),
        }));

        Ok(Self {
            settings,
            pipeline,
            executor,
            limiter,
            metrics,
            shutdown,
        })
    }
}

/// Builds the service router with the full middleware chain.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    // The streaming count in the body-limit middleware is authoritative;
    // axum's built-in limit would otherwise cap configured values above
    // its 2 MiB default.
    let body_cap = match state.settings.hardening.body_limit.max_bytes {
        0 => axum::extract::DefaultBodyLimit::disable(),
        max_bytes => axum::extract::DefaultBodyLimit::max(max_bytes),
    };

    Router::new()
        .route("/ingest", post(routes::ingest))
        .route("/ingest/batch", post(routes::ingest_batch))
        .route("/retry/:ticket_id", post(routes::retry))
        .route("/jobs/:ticket_id", get(routes::job_status))
        .route("/healthz", get(routes::healthz))
        .route("/metrics", get(routes::metrics))
        .layer(from_fn_with_state(state.clone(), middleware::hmac_verify))
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(from_fn_with_state(state.clone(), middleware::body_limit))
        .layer(from_fn(middleware::request_id))
        .layer(body_cap)
        .with_state(state)
}
