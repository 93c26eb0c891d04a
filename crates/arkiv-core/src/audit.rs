//! The audit sidecar record.
//!
//! Every archived PDF is accompanied by `<pdf-name>.json`: a small,
//! stable-key-order JSON document carrying the checksum and provenance of
//! the archived bytes. The SHA-256 is computed over the exact bytes
//! written, after signing.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::snapshot::Snapshot;
use crate::{SERVICE_NAME, SERVICE_VERSION};

/// Signing provenance embedded in the audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningInfo {
    /// Whether the archived PDF carries a signature.
    pub enabled: bool,
    /// Whether an RFC3161 timestamp was embedded.
    pub tsa_used: bool,
    /// Lowercase hex SHA-256 of the DER-encoded signer certificate, when
    /// signing occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_fingerprint: Option<String>,
}

/// Service provenance embedded in the audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Service name.
    pub name: String,
    /// Service version.
    pub version: String,
    /// Runtime version the binary was built with.
    pub runtime_version: String,
}

/// The audit sidecar record. Field order is the serialised key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Ticket id.
    pub ticket_id: u64,
    /// Human-facing ticket number.
    pub ticket_number: String,
    /// Ticket title (trimmed; empty when absent).
    pub title: String,
    /// Archive instant, UTC ISO-8601.
    pub created_at: String,
    /// Absolute path of the archived PDF.
    pub storage_path: String,
    /// Lowercase hex SHA-256 of the archived bytes.
    pub sha256: String,
    /// Signing provenance.
    pub signing: SigningInfo,
    /// Service provenance.
    pub service: ServiceInfo,
    /// Articles dropped by the cap-and-continue policy, when any were.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated_articles: Option<usize>,
}

/// Computes the lowercase hex SHA-256 of a byte slice.
#[must_use]
pub fn compute_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Formats a UTC instant as second-precision ISO-8601 with a `Z` suffix.
#[must_use]
pub fn format_timestamp_utc(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Assembles the audit record for an archived PDF.
#[must_use]
pub fn build_audit_record(
    snapshot: &Snapshot,
    storage_path: &str,
    pdf_bytes: &[u8],
    archived_at: DateTime<Utc>,
    signing: SigningInfo,
) -> AuditRecord {
    AuditRecord {
        ticket_id: snapshot.ticket.id,
        ticket_number: snapshot.ticket.number.clone(),
        title: snapshot
            .ticket
            .title
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_owned(),
        created_at: format_timestamp_utc(archived_at),
        storage_path: storage_path.to_owned(),
        sha256: compute_sha256(pdf_bytes),
        signing,
        service: ServiceInfo {
            name: SERVICE_NAME.to_owned(),
            version: SERVICE_VERSION.to_owned(),
            runtime_version: rustc_version(),
        },
        truncated_articles: snapshot.truncated_articles,
    }
}

impl AuditRecord {
    /// Serialises the record as pretty UTF-8 JSON with a trailing newline.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json::Error` only when serialisation itself fails,
    /// which the record's shape does not allow in practice.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

fn rustc_version() -> String {
    // The toolchain version is not exposed at runtime; the crate's MSRV is
    // the closest stable statement of the build environment.
    format!("rust-{}", env!("CARGO_PKG_RUST_VERSION"))
}
