//! Failure taxonomy for the processing pipeline.
//!
//! Every failure that reaches the orchestrator carries a stable [`ErrorCode`]
//! and a [`Classification`]. The classification decides whether the trigger
//! tag is preserved on the ticket (transient → the next webhook retries) or
//! removed (permanent → an operator must intervene).
//!
//! Adapters construct [`JobError`] values through [`JobError::transient`] and
//! [`JobError::permanent`] or via `From` conversions on their own error
//! enums; the orchestrator is the only place that turns a `JobError` into
//! observable state (error note, tag transition, log event).
//!
//! Cancellation is a first-class signal: it is neither transient nor
//! permanent, runs the same cleanup path, and is then re-propagated.

use thiserror::Error;

/// Whether a failed job may succeed on replay without operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Likely to succeed when retried (network flakiness, upstream 5xx).
    Transient,
    /// Will not succeed without a config, data, or material fix.
    Permanent,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "Transient"),
            Self::Permanent => write!(f, "Permanent"),
        }
    }
}

/// Stable, closed set of failure codes surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ErrorCode {
    TmsAuth,
    TmsNotFound,
    TmsServer,
    TmsTimeout,
    Snapshot,
    Render,
    ArticleLimitExceeded,
    SigningMaterial,
    SigningFailed,
    TsaTimeout,
    TsaBadResponse,
    TsaMisconfigured,
    PathPolicy,
    Storage,
    Unknown,
}

impl ErrorCode {
    /// Snake-case identifier used in notes and structured logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TmsAuth => "tms_auth",
            Self::TmsNotFound => "tms_not_found",
            Self::TmsServer => "tms_server",
            Self::TmsTimeout => "tms_timeout",
            Self::Snapshot => "snapshot",
            Self::Render => "render",
            Self::ArticleLimitExceeded => "article_limit_exceeded",
            Self::SigningMaterial => "signing_material",
            Self::SigningFailed => "signing_failed",
            Self::TsaTimeout => "tsa_timeout",
            Self::TsaBadResponse => "tsa_bad_response",
            Self::TsaMisconfigured => "tsa_misconfigured",
            Self::PathPolicy => "path_policy",
            Self::Storage => "storage",
            Self::Unknown => "unknown",
        }
    }

    /// Short, concrete operator hint for the ticket error note.
    #[must_use]
    pub const fn hint(self) -> &'static str {
        match self {
            Self::TmsAuth => "Fix the TMS API token or its permissions, then reapply the trigger tag.",
            Self::TmsNotFound => "Verify the ticket still exists in the TMS, then reapply the trigger tag.",
            Self::TmsServer => "The TMS reported a server error; the trigger tag is kept for retry.",
            Self::TmsTimeout => "The TMS did not answer in time; the trigger tag is kept for retry.",
            Self::Snapshot => "The ticket payload is missing required fields; fix the ticket data.",
            Self::Render => "PDF rendering failed; check the template configuration.",
            Self::ArticleLimitExceeded => {
                "The ticket exceeds the configured article limit; raise the limit or switch to cap_and_continue."
            },
            Self::SigningMaterial => "Check the PKCS#12 bundle path, password, and certificate validity window.",
            Self::SigningFailed => "Signing failed; check the signing material and service logs.",
            Self::TsaTimeout => "The timestamp authority did not answer in time; the trigger tag is kept for retry.",
            Self::TsaBadResponse => "The timestamp authority returned a malformed response; check the TSA endpoint.",
            Self::TsaMisconfigured => "TSA basic auth requires both user and password, or neither.",
            Self::PathPolicy => "Check the archive_path segments (no '.', '..', separators; depth and length limits).",
            Self::Storage => "Check the storage root mount, permissions, and free space.",
            Self::Unknown => "Unclassified failure; see the service logs for details.",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified pipeline failure.
#[derive(Debug, Error)]
pub enum JobError {
    /// Retryable failure; the trigger tag is restored so the next webhook
    /// (or `/retry`) re-runs the job.
    #[error("{code}: {message}")]
    Transient {
        /// Stable failure code.
        code: ErrorCode,
        /// Human-readable message (scrubbed before it leaves the process).
        message: String,
    },

    /// Non-retryable failure; the trigger tag is removed and the ticket is
    /// parked in the error state until an operator intervenes.
    #[error("{code}: {message}")]
    Permanent {
        /// Stable failure code.
        code: ErrorCode,
        /// Human-readable message (scrubbed before it leaves the process).
        message: String,
    },

    /// The job was cancelled (graceful shutdown). Cleanup still runs; the
    /// signal is then re-propagated unchanged.
    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    /// Builds a transient failure.
    pub fn transient(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Transient {
            code,
            message: message.into(),
        }
    }

    /// Builds a permanent failure.
    pub fn permanent(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Permanent {
            code,
            message: message.into(),
        }
    }

    /// The classification, or `None` for cancellation.
    #[must_use]
    pub const fn classification(&self) -> Option<Classification> {
        match self {
            Self::Transient { .. } => Some(Classification::Transient),
            Self::Permanent { .. } => Some(Classification::Permanent),
            Self::Cancelled => None,
        }
    }

    /// The stable failure code, or `None` for cancellation.
    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Transient { code, .. } | Self::Permanent { code, .. } => Some(*code),
            Self::Cancelled => None,
        }
    }

    /// Whether the trigger tag must be preserved after the error
    /// transition. True exactly when the failure is transient.
    #[must_use]
    pub const fn keep_trigger(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Classifies a raw I/O failure during storage operations.
    ///
    /// I/O errors are transient (the share may come back); anything that
    /// crossed the root boundary is raised as `PathPolicy` by the storage
    /// layer before this is reached.
    #[must_use]
    pub fn from_storage_io(err: &std::io::Error) -> Self {
        Self::transient(ErrorCode::Storage, format!("storage I/O error: {err}"))
    }
}
