//! Prometheus metrics for the processing pipeline.
//!
//! One registry per process, shared between the pipeline (which records)
//! and the ingress (which exposes the text format at `GET /metrics`). All
//! metrics use interior mutability and are safe to share across jobs.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Histogram buckets for per-stage durations (seconds).
const STAGE_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Errors from metrics setup or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A metric failed to register (duplicate name).
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    /// Encoding the exposition format failed.
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// The service's metric families.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Successfully archived tickets.
    pub processed_total: IntCounter,
    /// Failed processing attempts.
    pub failed_total: IntCounter,
    /// Skipped jobs, by reason.
    pub skipped_total: IntCounterVec,
    /// Seconds spent rendering.
    pub render_seconds: Histogram,
    /// Seconds spent signing (including the TSA exchange).
    pub sign_seconds: Histogram,
    /// Seconds spent per job end-to-end.
    pub total_seconds: Histogram,
}

impl Metrics {
    /// Creates and registers the metric families.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Registration`] on a duplicate registration,
    /// which only happens when two registries share a process by mistake.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let processed_total = IntCounter::with_opts(Opts::new(
            "arkiv_processed_total",
            "Number of successfully archived tickets.",
        ))?;
        let failed_total = IntCounter::with_opts(Opts::new(
            "arkiv_failed_total",
            "Number of failed ticket processing attempts.",
        ))?;
        let skipped_total = IntCounterVec::new(
            Opts::new("arkiv_skipped_total", "Number of skipped jobs, by reason."),
            &["reason"],
        )?;
        let render_seconds = Histogram::with_opts(
            HistogramOpts::new("arkiv_render_seconds", "Seconds spent rendering the PDF.")
                .buckets(STAGE_BUCKETS.to_vec()),
        )?;
        let sign_seconds = Histogram::with_opts(
            HistogramOpts::new("arkiv_sign_seconds", "Seconds spent signing the PDF.")
                .buckets(STAGE_BUCKETS.to_vec()),
        )?;
        let total_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "arkiv_total_seconds",
                "Seconds spent processing a ticket end-to-end.",
            )
            .buckets(STAGE_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(processed_total.clone()))?;
        registry.register(Box::new(failed_total.clone()))?;
        registry.register(Box::new(skipped_total.clone()))?;
        registry.register(Box::new(render_seconds.clone()))?;
        registry.register(Box::new(sign_seconds.clone()))?;
        registry.register(Box::new(total_seconds.clone()))?;

        Ok(Self {
            registry,
            processed_total,
            failed_total,
            skipped_total,
            render_seconds,
            sign_seconds,
            total_seconds,
        })
    }

    /// Records a skipped job.
    pub fn record_skip(&self, reason: &str) {
        self.skipped_total.with_label_values(&[reason]).inc();
    }

    /// Encodes the registry in the Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Encoding`] when the encoder fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|err| MetricsError::Encoding(err.to_string()))?;
        String::from_utf8(buffer).map_err(|err| MetricsError::Encoding(err.to_string()))
    }
}
