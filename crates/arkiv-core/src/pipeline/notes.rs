//! Ticket note bodies.
//!
//! Success and error notes are small HTML fragments posted as internal
//! articles. Every interpolated value is HTML-escaped, and free-form
//! messages are scrubbed and truncated before they get here.

use crate::error::{Classification, ErrorCode};
use crate::SERVICE_VERSION;

/// Maximum length of the error message carried into a note.
pub const MAX_NOTE_MESSAGE_CHARS: usize = 500;

/// Escapes a string for interpolation into HTML.
#[must_use]
pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn item(label: &str, value: &str) -> String {
    format!("<li>{label}: <code>{}</code></li>", escape_html(value))
}

/// Subject line for the success note.
#[must_use]
pub fn success_subject() -> String {
    format!("PDF archived (arkiv {SERVICE_VERSION})")
}

/// Subject line for the error note.
#[must_use]
pub fn error_subject() -> String {
    format!("PDF archiver error (arkiv {SERVICE_VERSION})")
}

/// Parameters of the success note.
pub struct SuccessNote<'a> {
    /// Directory the PDF landed in.
    pub storage_dir: &'a str,
    /// PDF filename.
    pub filename: &'a str,
    /// Sidecar path.
    pub sidecar_path: &'a str,
    /// PDF size in bytes.
    pub size_bytes: usize,
    /// Lowercase hex SHA-256 of the PDF.
    pub sha256_hex: &'a str,
    /// Request id, when known.
    pub request_id: Option<&'a str>,
    /// Delivery id, when known.
    pub delivery_id: Option<&'a str>,
    /// UTC timestamp string.
    pub timestamp_utc: &'a str,
}

/// Renders the success note body.
#[must_use]
pub fn success_note_html(note: &SuccessNote<'_>) -> String {
    let mut out = format!("<p><strong>{}</strong></p><ul>", escape_html(&success_subject()));
    out.push_str(&item("path", note.storage_dir));
    out.push_str(&item("filename", note.filename));
    out.push_str(&item("audit_sidecar", note.sidecar_path));
    out.push_str(&item("size_bytes", &note.size_bytes.to_string()));
    out.push_str(&item("sha256", note.sha256_hex));
    out.push_str(&item("request_id", note.request_id.unwrap_or("unknown")));
    out.push_str(&item("delivery_id", note.delivery_id.unwrap_or("none")));
    out.push_str(&item("time_utc", note.timestamp_utc));
    out.push_str("</ul>");
    out
}

/// Parameters of the error note.
pub struct ErrorNote<'a> {
    /// Transient or permanent.
    pub classification: Classification,
    /// Stable failure code.
    pub code: ErrorCode,
    /// Scrubbed, truncated message.
    pub message: &'a str,
    /// Request id, when known.
    pub request_id: Option<&'a str>,
    /// Delivery id, when known.
    pub delivery_id: Option<&'a str>,
    /// UTC timestamp string.
    pub timestamp_utc: &'a str,
}

/// Operator guidance for the note, derived from the classification.
#[must_use]
pub fn action_hint(classification: Classification, trigger_tag: &str) -> String {
    match classification {
        Classification::Transient => format!(
            "Transient failure. Verify TMS/TSA reachability and storage availability; \
             the ticket keeps {trigger_tag} so the next webhook retries the job."
        ),
        Classification::Permanent => format!(
            "Non-retryable failure. Fix the underlying issue, then reapply {trigger_tag} \
             to reprocess."
        ),
    }
}

/// Renders the error note body.
#[must_use]
pub fn error_note_html(note: &ErrorNote<'_>, trigger_tag: &str) -> String {
    let mut out = format!("<p><strong>{}</strong></p><ul>", escape_html(&error_subject()));
    out.push_str(&item("classification", &note.classification.to_string()));
    out.push_str(&item("error", note.message));
    out.push_str(&item("action", &action_hint(note.classification, trigger_tag)));
    out.push_str(&item("code", note.code.as_str()));
    out.push_str(&item("hint", note.code.hint()));
    out.push_str(&item("request_id", note.request_id.unwrap_or("unknown")));
    out.push_str(&item("delivery_id", note.delivery_id.unwrap_or("none")));
    out.push_str(&item("time_utc", note.timestamp_utc));
    out.push_str("</ul>");
    out
}

/// Truncates a message to the note limit on a character boundary.
#[must_use]
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_NOTE_MESSAGE_CHARS {
        message.to_owned()
    } else {
        message.chars().take(MAX_NOTE_MESSAGE_CHARS).collect()
    }
}
