//! Wire models for the TMS REST API.
//!
//! Decoding is tolerant: unknown fields are ignored and almost everything
//! is optional, because TMS deployments differ in which fields they
//! populate. The snapshot builder normalises these into the stable
//! render-ready shape.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Reference to a TMS user embedded in a ticket payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TmsUserRef {
    /// User id.
    pub id: Option<u64>,
    /// Login name.
    pub login: Option<String>,
    /// Email address.
    pub email: Option<String>,
}

/// Ticket preferences blob; custom fields live here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TmsTicketPreferences {
    /// Custom field map.
    pub custom_fields: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A ticket as returned by `GET tickets/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TmsTicket {
    /// Ticket id.
    pub id: u64,
    /// Human-facing ticket number.
    pub number: String,
    /// Ticket title.
    pub title: Option<String>,
    /// Creation instant.
    pub created_at: Option<DateTime<Utc>>,
    /// Last-update instant.
    pub updated_at: Option<DateTime<Utc>>,
    /// Ticket owner.
    pub owner: Option<TmsUserRef>,
    /// The agent who last updated the ticket.
    pub updated_by: Option<TmsUserRef>,
    /// The customer.
    pub customer: Option<TmsUserRef>,
    /// Preferences blob.
    pub preferences: Option<TmsTicketPreferences>,
}

impl TmsTicket {
    /// The ticket's custom fields, or an empty map.
    #[must_use]
    pub fn custom_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        self.preferences
            .as_ref()
            .and_then(|prefs| prefs.custom_fields.clone())
            .unwrap_or_default()
    }
}

/// Attachment metadata on an article.
#[derive(Debug, Clone, Deserialize)]
pub struct TmsAttachment {
    /// Attachment id.
    pub id: Option<u64>,
    /// Original filename.
    pub filename: Option<String>,
    /// Size in bytes.
    pub size: Option<u64>,
    /// MIME type.
    pub content_type: Option<String>,
}

/// An article as returned by `GET ticket_articles/by_ticket/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TmsArticle {
    /// Article id.
    pub id: u64,
    /// Creation instant.
    pub created_at: Option<DateTime<Utc>>,
    /// Whether the article is internal.
    pub internal: Option<bool>,
    /// Subject line.
    pub subject: Option<String>,
    /// Raw body (HTML or plain text, see `content_type`).
    pub body: Option<String>,
    /// Body content type.
    pub content_type: Option<String>,
    /// Sender display string.
    #[serde(rename = "from")]
    pub sender: Option<String>,
    /// Recipient display string.
    pub to: Option<String>,
    /// Attachment metadata.
    pub attachments: Option<Vec<TmsAttachment>>,
}

/// The tag listing response, which historically comes in two shapes: a raw
/// JSON array or an object wrapper.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TmsTagResponse {
    /// `{"tags": ["a", "b"]}`
    Wrapped {
        /// The tag list.
        tags: Vec<String>,
    },
    /// `["a", "b"]`
    Bare(Vec<String>),
}

impl TmsTagResponse {
    /// Unwraps either shape into the tag list.
    #[must_use]
    pub fn into_tags(self) -> Vec<String> {
        match self {
            Self::Wrapped { tags } | Self::Bare(tags) => tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_decodes_with_unknown_fields() {
        let ticket: TmsTicket = serde_json::from_value(serde_json::json!({
            "id": 7,
            "number": "70042",
            "title": "t",
            "group_id": 3,
            "state": "open",
            "owner": {"login": "agent", "roles": [1, 2]},
            "preferences": {"custom_fields": {"archive_path": "A > B"}, "channel": "email"}
        }))
        .unwrap();
        assert_eq!(ticket.id, 7);
        assert_eq!(ticket.custom_fields()["archive_path"], "A > B");
    }

    #[test]
    fn tag_response_accepts_both_shapes() {
        let bare: TmsTagResponse = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        assert_eq!(bare.into_tags(), vec!["a", "b"]);

        let wrapped: TmsTagResponse = serde_json::from_str(r#"{"tags": ["x"]}"#).unwrap();
        assert_eq!(wrapped.into_tags(), vec!["x"]);
    }

    #[test]
    fn article_sender_comes_from_the_from_key() {
        let article: TmsArticle = serde_json::from_value(serde_json::json!({
            "id": 1,
            "from": "Jane <jane@acme.example>",
            "body": "hi"
        }))
        .unwrap();
        assert_eq!(article.sender.as_deref(), Some("Jane <jane@acme.example>"));
    }
}
