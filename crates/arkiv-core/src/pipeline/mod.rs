//! The per-ticket processing orchestrator.
//!
//! One webhook delivery becomes one job. The orchestrator owns the exact
//! step order and the failure policy; adapters never write notes or
//! transition tags themselves.
//!
//! The ordered flow (after ingress validation and acknowledgement):
//!
//! 1. acquire the in-flight lock (busy → skip, without touching the
//!    delivery registry)
//! 2. claim the delivery id (duplicate → skip)
//! 3. fetch tags, evaluate eligibility (ineligible → skip, no writes)
//! 4. transition to processing
//! 5. fetch ticket and articles, build the snapshot
//! 6. render, then sign and timestamp when configured
//! 7. resolve the archive path and write the PDF atomically
//! 8. build and write the audit sidecar
//! 9. post the success note, then transition to done
//!
//! Any failing step funnels into a single handler that classifies the
//! error once, posts one scrubbed error note, transitions to the error
//! state (keeping the trigger tag exactly when the failure is transient),
//! and releases the lock. Cancellation runs tag repair and lock release,
//! then surfaces as its own outcome. The lock release is a drop guard, so
//! it runs on every exit path.

pub mod dispatcher;
pub mod notes;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::audit::{self, SigningInfo};
use crate::config::{FieldsSettings, Settings};
use crate::error::{Classification, ErrorCode, JobError};
use crate::idempotency::{Claim, DeliveryRegistry, InFlightSet};
use crate::metrics::Metrics;
use crate::path_policy;
use crate::redact::SecretRedactor;
use crate::render::{PdfRenderer, RenderOptions};
use crate::signing::Signer;
use crate::snapshot::{self, HtmlSanitizer};
use crate::storage::{self, WriteOptions};
use crate::tags::TagTransition;
use crate::tms::models::TmsTicket;
use crate::tms::TicketApi;
use crate::tsa::TsaClient;
use dispatcher::ShutdownState;

/// Identity of one job.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The ticket to archive.
    pub ticket_id: u64,
    /// Delivery id from the webhook, when supplied.
    pub delivery_id: Option<String>,
    /// Request id minted or accepted at ingress.
    pub request_id: Option<String>,
    /// `user.login` from the webhook payload, for `current_agent` mode.
    pub webhook_user_login: Option<String>,
}

/// Terminal outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Archived successfully.
    Processed,
    /// Another job for the same ticket is running in this process.
    SkippedInFlight,
    /// The delivery id was already claimed within its TTL.
    SkippedDeliverySeen,
    /// The eligibility gate said no (done tag present or trigger absent).
    SkippedNotTriggered,
    /// The job failed; the ticket carries the error tag.
    Failed {
        /// Transient or permanent.
        classification: Classification,
        /// Stable failure code.
        code: ErrorCode,
    },
    /// The job was cancelled during shutdown; tags were repaired.
    Cancelled,
}

enum RunOutcome {
    Processed,
    NotTriggered,
}

/// Everything the orchestrator needs, injected explicitly.
pub struct PipelineParts {
    /// Immutable configuration.
    pub settings: Arc<Settings>,
    /// TMS operations.
    pub tms: Arc<dyn TicketApi>,
    /// PDF producer.
    pub renderer: Arc<dyn PdfRenderer>,
    /// Article body filter.
    pub sanitizer: Arc<dyn HtmlSanitizer>,
    /// Signer, when signing is enabled.
    pub signer: Option<Arc<Signer>>,
    /// TSA client, when timestamping is enabled.
    pub tsa: Option<Arc<TsaClient>>,
    /// Delivery-id registry.
    pub deliveries: Arc<DeliveryRegistry>,
    /// In-flight ticket set.
    pub in_flight: InFlightSet,
    /// Metric families.
    pub metrics: Metrics,
    /// Secret scrubber for notes and logs.
    pub redactor: Arc<SecretRedactor>,
    /// Shutdown and cancellation flags.
    pub shutdown: ShutdownState,
}

/// The processing orchestrator.
pub struct Pipeline {
    parts: PipelineParts,
}

impl Pipeline {
    /// Wraps the injected parts.
    #[must_use]
    pub fn new(parts: PipelineParts) -> Self {
        Self { parts }
    }

    /// The in-flight set (exposed for the `/jobs` endpoint).
    #[must_use]
    pub fn in_flight(&self) -> &InFlightSet {
        &self.parts.in_flight
    }

    fn check_cancelled(&self) -> Result<(), JobError> {
        if self.parts.shutdown.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs one job end to end.
    pub async fn process_ticket(&self, ctx: JobContext) -> JobOutcome {
        let started = Instant::now();
        let parts = &self.parts;

        // In-flight lock first; a busy skip must not poison the delivery
        // registry, so the claim comes strictly after the acquire.
        let Some(_guard) = parts.in_flight.try_acquire(ctx.ticket_id) else {
            info!(
                ticket_id = ctx.ticket_id,
                delivery_id = ctx.delivery_id.as_deref(),
                "skip_ticket_in_flight"
            );
            parts.metrics.record_skip("in_flight");
            return JobOutcome::SkippedInFlight;
        };

        if let Some(delivery_id) = ctx.delivery_id.as_deref() {
            if parts.settings.workflow.delivery_id_ttl_seconds > 0
                && parts.deliveries.claim(delivery_id, Instant::now()) == Claim::Duplicate
            {
                info!(
                    ticket_id = ctx.ticket_id,
                    delivery_id, "skip_delivery_id_seen"
                );
                parts.metrics.record_skip("delivery_id_seen");
                return JobOutcome::SkippedDeliverySeen;
            }
        }

        match self.run(&ctx).await {
            Ok(RunOutcome::Processed) => {
                parts.metrics.processed_total.inc();
                parts.metrics.total_seconds.observe(started.elapsed().as_secs_f64());
                JobOutcome::Processed
            },
            Ok(RunOutcome::NotTriggered) => {
                parts.metrics.record_skip("not_triggered");
                JobOutcome::SkippedNotTriggered
            },
            Err(JobError::Cancelled) => {
                self.cleanup_cancelled(&ctx).await;
                JobOutcome::Cancelled
            },
            Err(err) => {
                parts.metrics.failed_total.inc();
                parts.metrics.total_seconds.observe(started.elapsed().as_secs_f64());
                self.handle_failure(&ctx, &err).await;
                JobOutcome::Failed {
                    classification: err.classification().unwrap_or(Classification::Permanent),
                    code: err.code().unwrap_or(ErrorCode::Unknown),
                }
            },
        }
    }

    async fn run(&self, ctx: &JobContext) -> Result<RunOutcome, JobError> {
        let parts = &self.parts;
        let settings = &parts.settings;
        let workflow = &settings.workflow;

        self.check_cancelled()?;
        let tags = parts.tms.list_tags(ctx.ticket_id).await?;
        if !workflow
            .tags
            .should_process(&tags, workflow.require_trigger_tag)
        {
            info!(ticket_id = ctx.ticket_id, ?tags, "skip_should_not_process");
            return Ok(RunOutcome::NotTriggered);
        }

        self.apply_transition(ctx.ticket_id, &workflow.tags.apply_processing())
            .await?;

        self.check_cancelled()?;
        let ticket = parts.tms.get_ticket(ctx.ticket_id).await?;
        let articles = parts.tms.list_articles(ctx.ticket_id).await?;
        let snapshot = snapshot::build_snapshot(
            &ticket,
            &tags,
            &articles,
            settings.pdf.article_limit(),
            parts.sanitizer.as_ref(),
        )?;

        let now = Utc::now();
        self.check_cancelled()?;
        let render_started = Instant::now();
        let render_options = RenderOptions {
            variant: settings.pdf.template_variant,
            prepare_signature_field: parts.signer.is_some(),
            generated_at: now,
            signature_reason: settings.signing.reason.clone(),
            signature_location: settings.signing.location.clone(),
        };
        let rendered = parts.renderer.render(&snapshot, &render_options)?;
        parts
            .metrics
            .render_seconds
            .observe(render_started.elapsed().as_secs_f64());

        let (pdf_bytes, tsa_used) = match parts.signer.as_ref() {
            Some(signer) => {
                self.check_cancelled()?;
                let sign_started = Instant::now();
                let signed = signer.sign(&rendered, parts.tsa.as_deref()).await?;
                parts
                    .metrics
                    .sign_seconds
                    .observe(sign_started.elapsed().as_secs_f64());
                (signed.bytes, signed.tsa_used)
            },
            None => (rendered, false),
        };

        let username = determine_username(&ticket, ctx.webhook_user_login.as_deref(), &settings.fields)?;
        let custom_fields = ticket.custom_fields();
        let segments =
            path_policy::parse_archive_path(custom_fields.get(&settings.fields.archive_path))?;
        let target_dir = path_policy::build_target_dir(
            &settings.storage.root,
            &username,
            &segments,
            settings.storage.allow_prefixes.as_deref(),
        )?;
        let filename = path_policy::build_filename(
            &settings.storage.filename_pattern,
            &snapshot.ticket.number,
            &now.format("%Y-%m-%d").to_string(),
        )?;
        let target_path = target_dir.join(&filename);

        self.check_cancelled()?;
        let write_options = WriteOptions {
            fsync: settings.storage.fsync,
            mode: 0o640,
        };
        let written = if settings.storage.atomic_write {
            storage::write_atomic(&settings.storage.root, &target_path, &pdf_bytes, &write_options)?
        } else {
            storage::write_direct(&settings.storage.root, &target_path, &pdf_bytes, &write_options)?
        };

        let signing_info = SigningInfo {
            enabled: parts.signer.is_some(),
            tsa_used,
            cert_fingerprint: parts
                .signer
                .as_ref()
                .map(|signer| signer.material().cert_fingerprint().to_owned()),
        };
        let record = audit::build_audit_record(
            &snapshot,
            &written.to_string_lossy(),
            &pdf_bytes,
            now,
            signing_info,
        );
        let sidecar_bytes = record
            .to_json_bytes()
            .map_err(|err| JobError::permanent(ErrorCode::Unknown, err.to_string()))?;
        let sidecar_path = target_dir.join(format!("{filename}.json"));
        let sidecar_written = if settings.storage.atomic_write {
            storage::write_atomic(&settings.storage.root, &sidecar_path, &sidecar_bytes, &write_options)?
        } else {
            storage::write_direct(&settings.storage.root, &sidecar_path, &sidecar_bytes, &write_options)?
        };

        if workflow.acknowledge_on_success {
            let note = notes::success_note_html(&notes::SuccessNote {
                storage_dir: &written.parent().unwrap_or(&target_dir).to_string_lossy(),
                filename: &filename,
                sidecar_path: &sidecar_written.to_string_lossy(),
                size_bytes: pdf_bytes.len(),
                sha256_hex: &record.sha256,
                request_id: ctx.request_id.as_deref(),
                delivery_id: ctx.delivery_id.as_deref(),
                timestamp_utc: &audit::format_timestamp_utc(now),
            });
            parts
                .tms
                .create_internal_note(ctx.ticket_id, &notes::success_subject(), &note)
                .await?;
        }

        // The success note lands before the done transition; a crash
        // between the two leaves an archived ticket still marked
        // processing, which the runbook repairs by hand.
        self.apply_done_best_effort(ctx.ticket_id).await;

        info!(
            ticket_id = ctx.ticket_id,
            storage_path = %written.display(),
            request_id = ctx.request_id.as_deref(),
            delivery_id = ctx.delivery_id.as_deref(),
            "ticket archived"
        );
        Ok(RunOutcome::Processed)
    }

    async fn apply_transition(
        &self,
        ticket_id: u64,
        transition: &TagTransition,
    ) -> Result<(), JobError> {
        for tag in &transition.remove {
            self.parts.tms.remove_tag(ticket_id, tag).await?;
        }
        for tag in &transition.add {
            self.parts.tms.add_tag(ticket_id, tag).await?;
        }
        Ok(())
    }

    async fn apply_done_best_effort(&self, ticket_id: u64) {
        let transition = self.parts.settings.workflow.tags.apply_done();
        let mut delay = Duration::from_millis(500);
        for attempt in 0..3u32 {
            match self.apply_transition(ticket_id, &transition).await {
                Ok(()) => return,
                Err(err) if attempt < 2 => {
                    warn!(ticket_id, attempt, error = %err, "done transition failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                },
                Err(err) => {
                    error!(ticket_id, error = %err, "done transition failed after retries");
                },
            }
        }
        // Last resort: drop the processing marker so the ticket is not
        // stuck in a transient-looking state.
        let processing = self.parts.settings.workflow.tags.processing.clone();
        if let Err(err) = self.parts.tms.remove_tag(ticket_id, &processing).await {
            error!(ticket_id, error = %err, "processing tag cleanup failed");
        }
    }

    async fn handle_failure(&self, ctx: &JobContext, err: &JobError) {
        let parts = &self.parts;
        let tags = &parts.settings.workflow.tags;
        let classification = err.classification().unwrap_or(Classification::Permanent);
        let code = err.code().unwrap_or(ErrorCode::Unknown);
        let message = notes::truncate_message(&parts.redactor.scrub(&err.to_string()));

        error!(
            ticket_id = ctx.ticket_id,
            request_id = ctx.request_id.as_deref(),
            delivery_id = ctx.delivery_id.as_deref(),
            classification = %classification,
            code = %code,
            message = %message,
            "ticket processing failed"
        );

        let note = notes::error_note_html(
            &notes::ErrorNote {
                classification,
                code,
                message: &message,
                request_id: ctx.request_id.as_deref(),
                delivery_id: ctx.delivery_id.as_deref(),
                timestamp_utc: &audit::format_timestamp_utc(Utc::now()),
            },
            &tags.trigger,
        );
        if let Err(note_err) = parts
            .tms
            .create_internal_note(ctx.ticket_id, &notes::error_subject(), &note)
            .await
        {
            error!(ticket_id = ctx.ticket_id, error = %note_err, "error note failed");
        }

        let transition = tags.apply_error(err.keep_trigger());
        let mut applied = self.apply_transition(ctx.ticket_id, &transition).await;
        if applied.is_err() {
            tokio::time::sleep(Duration::from_millis(300)).await;
            applied = self.apply_transition(ctx.ticket_id, &transition).await;
        }
        if let Err(transition_err) = applied {
            error!(
                ticket_id = ctx.ticket_id,
                error = %transition_err,
                "error transition failed"
            );
        }

        // Always try to drop the processing marker, even when the error
        // transition just did; the extra remove is idempotent.
        if let Err(cleanup_err) = parts.tms.remove_tag(ctx.ticket_id, &tags.processing).await {
            error!(
                ticket_id = ctx.ticket_id,
                error = %cleanup_err,
                "processing tag cleanup failed"
            );
        }
    }

    async fn cleanup_cancelled(&self, ctx: &JobContext) {
        let tags = &self.parts.settings.workflow.tags;
        warn!(
            ticket_id = ctx.ticket_id,
            request_id = ctx.request_id.as_deref(),
            "job cancelled during shutdown; repairing tags"
        );
        if let Err(err) = self
            .parts
            .tms
            .remove_tag(ctx.ticket_id, &tags.processing)
            .await
        {
            warn!(ticket_id = ctx.ticket_id, error = %err, "processing tag repair failed");
        }
        // Restore the trigger so a replay can re-run the job.
        if let Err(err) = self.parts.tms.add_tag(ctx.ticket_id, &tags.trigger).await {
            warn!(ticket_id = ctx.ticket_id, error = %err, "trigger tag restore failed");
        }
    }
}

/// Resolves the user segment for the archive path.
///
/// # Errors
///
/// Returns `Permanent(Snapshot)` when the selected mode has no usable
/// login value.
pub fn determine_username(
    ticket: &TmsTicket,
    webhook_user_login: Option<&str>,
    fields: &FieldsSettings,
) -> Result<String, JobError> {
    let custom_fields = ticket.custom_fields();
    let mode_value = custom_fields.get(&fields.archive_user_mode);
    let mode = match mode_value {
        None | Some(serde_json::Value::Null) => "owner".to_owned(),
        Some(serde_json::Value::String(raw)) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                "owner".to_owned()
            } else {
                trimmed.to_owned()
            }
        },
        Some(other) => {
            return Err(JobError::permanent(
                ErrorCode::Snapshot,
                format!("unsupported {} value: {other}", fields.archive_user_mode),
            ));
        },
    };

    let require = |value: Option<&str>, field: &str| -> Result<String, JobError> {
        value
            .map(str::trim)
            .filter(|login| !login.is_empty())
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                JobError::permanent(ErrorCode::Snapshot, format!("{field} is missing or empty"))
            })
    };

    match mode.as_str() {
        "owner" => require(
            ticket.owner.as_ref().and_then(|owner| owner.login.as_deref()),
            "ticket.owner.login",
        ),
        "current_agent" => {
            if let Some(login) = webhook_user_login.map(str::trim).filter(|l| !l.is_empty()) {
                return Ok(login.to_owned());
            }
            require(
                ticket
                    .updated_by
                    .as_ref()
                    .and_then(|user| user.login.as_deref()),
                "ticket.updated_by.login",
            )
        },
        "fixed" => require(
            custom_fields
                .get(&fields.archive_user)
                .and_then(|value| value.as_str()),
            &format!("custom_fields.{}", fields.archive_user),
        ),
        other => Err(JobError::permanent(
            ErrorCode::Snapshot,
            format!("unsupported archive_user_mode: {other:?}"),
        )),
    }
}
