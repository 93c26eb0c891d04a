//! Render-ready ticket snapshots.
//!
//! A snapshot is the normalised projection of a ticket plus its tags and
//! articles: stable field names, UTC instants, sanitised HTML bodies, and a
//! deterministic article order. The snapshot is a tree (ticket → articles →
//! attachment metadata); the renderer and the audit builder consume it
//! without reaching back into TMS payloads.
//!
//! Building a snapshot is a pure function of the fetched data - no I/O -
//! which keeps the article-limit policy and the ordering contract trivially
//! testable.

pub mod sanitize;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ErrorCode, JobError};
use crate::tms::models::{TmsArticle, TmsTicket};

pub use sanitize::{AllowlistSanitizer, HtmlSanitizer};

/// Reference to a person on the ticket (customer, owner).
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartyRef {
    /// TMS user id.
    pub id: Option<u64>,
    /// Login name.
    pub login: Option<String>,
    /// Email address.
    pub email: Option<String>,
}

/// Normalised ticket header.
#[derive(Debug, Clone, Serialize)]
pub struct TicketMeta {
    /// Ticket id.
    pub id: u64,
    /// Human-facing ticket number.
    pub number: String,
    /// Ticket title.
    pub title: Option<String>,
    /// Creation instant (UTC).
    pub created_at: Option<DateTime<Utc>>,
    /// Last-update instant (UTC).
    pub updated_at: Option<DateTime<Utc>>,
    /// Customer reference.
    pub customer: Option<PartyRef>,
    /// Owner reference.
    pub owner: Option<PartyRef>,
    /// Current tags.
    pub tags: Vec<String>,
    /// Custom fields, verbatim.
    pub custom_fields: serde_json::Map<String, serde_json::Value>,
}

/// Attachment metadata. Binary content is out of scope; attachments are
/// metadata-only.
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentMeta {
    /// Owning article id.
    pub article_id: u64,
    /// Attachment id within the article.
    pub attachment_id: Option<u64>,
    /// Original filename.
    pub filename: Option<String>,
    /// Size in bytes, when reported.
    pub size: Option<u64>,
    /// MIME type, when reported.
    pub content_type: Option<String>,
}

/// One normalised article.
#[derive(Debug, Clone, Serialize)]
pub struct Article {
    /// Article id.
    pub id: u64,
    /// Creation instant (UTC).
    pub created_at: Option<DateTime<Utc>>,
    /// Whether the article is internal (not customer-visible).
    pub internal: bool,
    /// Sender display string.
    pub sender: Option<String>,
    /// Subject line.
    pub subject: Option<String>,
    /// Sanitised HTML body; empty when the source was plain text or
    /// sanitisation removed everything.
    pub body_html: String,
    /// Plain-text body; the renderer falls back to this when `body_html`
    /// is empty.
    pub body_text: String,
    /// Attachment metadata.
    pub attachments: Vec<AttachmentMeta>,
}

/// The complete render-ready snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Ticket header.
    pub ticket: TicketMeta,
    /// Articles sorted by `(created_at asc, id asc)`.
    pub articles: Vec<Article>,
    /// Number of articles dropped by the `cap_and_continue` policy, if any.
    pub truncated_articles: Option<usize>,
}

/// What to do when the article count exceeds the configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleLimitMode {
    /// Raise a permanent failure.
    Fail,
    /// Truncate to the limit and record a warning in the audit record.
    CapAndContinue,
}

/// Article-count policy.
#[derive(Debug, Clone, Copy)]
pub struct ArticleLimit {
    /// Maximum article count; `0` disables the limit.
    pub limit: usize,
    /// Over-limit behaviour.
    pub mode: ArticleLimitMode,
}

fn looks_like_html(content_type: Option<&str>, body: &str) -> bool {
    if content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("html")) {
        return true;
    }
    // Heuristic: only treat bodies as HTML when they contain a common tag.
    const HINTS: &[&str] = &[
        "<p", "<div", "<br", "<span", "<a ", "<a>", "<ul", "<ol", "<li", "<pre", "<code",
        "<blockquote", "<table", "<tr", "<td", "<th", "<strong", "<em", "<b>", "<i>", "<u>",
    ];
    let lower = body.to_ascii_lowercase();
    HINTS.iter().any(|hint| lower.contains(hint))
}

fn party_from(reference: Option<&crate::tms::models::TmsUserRef>) -> Option<PartyRef> {
    reference.map(|user| PartyRef {
        id: user.id,
        login: user.login.clone(),
        email: user.email.clone(),
    })
}

fn article_from(raw: &TmsArticle, sanitizer: &dyn HtmlSanitizer) -> Article {
    let body_raw = raw.body.as_deref().unwrap_or_default();
    let mut body_html = String::new();
    let mut body_text = String::new();

    if !body_raw.is_empty() {
        if looks_like_html(raw.content_type.as_deref(), body_raw) {
            body_html = sanitizer.sanitize(body_raw);
            body_text = if body_html.is_empty() {
                // Sanitisation removed everything; never fall back to the
                // raw body as HTML.
                sanitize::html_to_text(body_raw)
            } else {
                sanitize::html_to_text(&body_html)
            };
        } else {
            body_text = body_raw.to_owned();
        }
    }
    if body_text.is_empty() && !body_raw.is_empty() {
        body_text = body_raw.to_owned();
    }

    let attachments = raw
        .attachments
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|att| AttachmentMeta {
            article_id: raw.id,
            attachment_id: att.id,
            filename: att.filename.clone(),
            size: att.size,
            content_type: att.content_type.clone(),
        })
        .collect();

    Article {
        id: raw.id,
        created_at: raw.created_at,
        internal: raw.internal.unwrap_or(false),
        sender: raw.sender.clone().or_else(|| raw.to.clone()),
        subject: raw.subject.clone(),
        body_html,
        body_text,
        attachments,
    }
}

/// Builds the snapshot from fetched TMS data.
///
/// Articles are sorted by `(created_at asc, id asc)`; articles without a
/// creation instant sort last. The article-count policy is applied after
/// sorting so truncation keeps the oldest articles.
///
/// # Errors
///
/// Returns `Permanent(ArticleLimitExceeded)` when the count exceeds the
/// limit and the mode is [`ArticleLimitMode::Fail`].
pub fn build_snapshot(
    ticket: &TmsTicket,
    tags: &[String],
    articles: &[TmsArticle],
    limit: ArticleLimit,
    sanitizer: &dyn HtmlSanitizer,
) -> Result<Snapshot, JobError> {
    let mut snapshot_articles: Vec<Article> = articles
        .iter()
        .map(|raw| article_from(raw, sanitizer))
        .collect();
    snapshot_articles.sort_by(|a, b| {
        let key_a = (a.created_at.is_none(), a.created_at, a.id);
        let key_b = (b.created_at.is_none(), b.created_at, b.id);
        key_a.cmp(&key_b)
    });

    let mut truncated_articles = None;
    if limit.limit > 0 && snapshot_articles.len() > limit.limit {
        match limit.mode {
            ArticleLimitMode::Fail => {
                return Err(JobError::permanent(
                    ErrorCode::ArticleLimitExceeded,
                    format!(
                        "ticket has {} articles, limit is {}",
                        snapshot_articles.len(),
                        limit.limit
                    ),
                ));
            },
            ArticleLimitMode::CapAndContinue => {
                let dropped = snapshot_articles.len() - limit.limit;
                snapshot_articles.truncate(limit.limit);
                truncated_articles = Some(dropped);
                tracing::warn!(
                    ticket_id = ticket.id,
                    dropped,
                    limit = limit.limit,
                    "article limit exceeded; capping and continuing"
                );
            },
        }
    }

    Ok(Snapshot {
        ticket: TicketMeta {
            id: ticket.id,
            number: ticket.number.clone(),
            title: ticket.title.clone(),
            created_at: ticket.created_at,
            updated_at: ticket.updated_at,
            customer: party_from(ticket.customer.as_ref()),
            owner: party_from(ticket.owner.as_ref()),
            tags: tags.to_vec(),
            custom_fields: ticket.custom_fields(),
        },
        articles: snapshot_articles,
        truncated_articles,
    })
}
