//! PDF rendering.
//!
//! Rendering is an opaque bytes producer behind [`PdfRenderer`]; the
//! pipeline does not care how the document is produced, only that the
//! result is a valid PDF and - when signing is enabled - carries the
//! prepared signature field the signer fills in.
//!
//! The built-in [`TextPdfRenderer`] emits a deterministic, paginated
//! plain-text rendition of the snapshot: ticket header, metadata, and the
//! article sequence with attachment listings. It exists so the service is
//! complete without an external HTML engine; deployments that want styled
//! output plug their own renderer in at this seam.

use chrono::{DateTime, Utc};

use crate::error::{ErrorCode, JobError};
use crate::signing::pdf::{byte_range_placeholder, contents_placeholder};
use crate::snapshot::{Article, Snapshot};

/// Which rendition to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateVariant {
    /// Full rendition: metadata plus every article body.
    Default,
    /// Header and metadata only.
    Minimal,
}

/// Options for one render pass.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Rendition variant.
    pub variant: TemplateVariant,
    /// Emit the prepared (invisible) signature field.
    pub prepare_signature_field: bool,
    /// Render instant, stamped into the document.
    pub generated_at: DateTime<Utc>,
    /// Signature reason, when a field is prepared.
    pub signature_reason: String,
    /// Signature location, when a field is prepared.
    pub signature_location: String,
}

/// Opaque bytes producer for the archived document.
pub trait PdfRenderer: Send + Sync {
    /// Renders the snapshot into PDF bytes.
    ///
    /// # Errors
    ///
    /// Returns `Permanent(Render)` when the snapshot cannot be rendered.
    fn render(&self, snapshot: &Snapshot, options: &RenderOptions) -> Result<Vec<u8>, JobError>;
}

/// The built-in deterministic text renderer.
#[derive(Default)]
pub struct TextPdfRenderer;

const PAGE_WIDTH: u32 = 595;
const PAGE_HEIGHT: u32 = 842;
const LINES_PER_PAGE: usize = 54;
const WRAP_COLUMNS: usize = 92;
const FONT_SIZE: u32 = 10;
const LEADING: u32 = 14;
const MARGIN: u32 = 50;

fn wrap_line(line: &str, out: &mut Vec<String>) {
    if line.chars().count() <= WRAP_COLUMNS {
        out.push(line.to_owned());
        return;
    }
    let chars: Vec<char> = line.chars().collect();
    for chunk in chars.chunks(WRAP_COLUMNS) {
        out.push(chunk.iter().collect());
    }
}

fn article_lines(article: &Article, out: &mut Vec<String>) {
    out.push("-".repeat(WRAP_COLUMNS));
    let created = article
        .created_at
        .map(crate::audit::format_timestamp_utc)
        .unwrap_or_else(|| "unknown".to_owned());
    let visibility = if article.internal { "internal" } else { "public" };
    wrap_line(
        &format!(
            "[{created}] {} ({visibility})",
            article.sender.as_deref().unwrap_or("unknown sender")
        ),
        out,
    );
    if let Some(subject) = article.subject.as_deref().filter(|s| !s.trim().is_empty()) {
        wrap_line(&format!("Subject: {subject}"), out);
    }
    out.push(String::new());
    for line in article.body_text.lines() {
        wrap_line(line, out);
    }
    if !article.attachments.is_empty() {
        out.push(String::new());
        out.push("Attachments:".to_owned());
        for attachment in &article.attachments {
            let size = attachment
                .size
                .map_or_else(|| "?".to_owned(), |bytes| bytes.to_string());
            wrap_line(
                &format!(
                    "  - {} ({size} bytes, {})",
                    attachment.filename.as_deref().unwrap_or("unnamed"),
                    attachment.content_type.as_deref().unwrap_or("unknown type"),
                ),
                out,
            );
        }
    }
    out.push(String::new());
}

fn document_lines(snapshot: &Snapshot, options: &RenderOptions) -> Vec<String> {
    let mut lines = Vec::new();
    let ticket = &snapshot.ticket;

    wrap_line(
        &format!(
            "Ticket {} - {}",
            ticket.number,
            ticket.title.as_deref().unwrap_or("(untitled)")
        ),
        &mut lines,
    );
    lines.push("=".repeat(WRAP_COLUMNS));
    if let Some(created) = ticket.created_at {
        lines.push(format!("Created:  {}", crate::audit::format_timestamp_utc(created)));
    }
    if let Some(updated) = ticket.updated_at {
        lines.push(format!("Updated:  {}", crate::audit::format_timestamp_utc(updated)));
    }
    if let Some(customer) = ticket.customer.as_ref() {
        wrap_line(
            &format!(
                "Customer: {}",
                customer
                    .email
                    .as_deref()
                    .or(customer.login.as_deref())
                    .unwrap_or("unknown")
            ),
            &mut lines,
        );
    }
    if let Some(owner) = ticket.owner.as_ref() {
        wrap_line(
            &format!("Owner:    {}", owner.login.as_deref().unwrap_or("unknown")),
            &mut lines,
        );
    }
    if !ticket.tags.is_empty() {
        wrap_line(&format!("Tags:     {}", ticket.tags.join(", ")), &mut lines);
    }
    lines.push(format!(
        "Archived: {}",
        crate::audit::format_timestamp_utc(options.generated_at)
    ));
    lines.push(String::new());

    match options.variant {
        TemplateVariant::Minimal => {
            lines.push(format!("{} article(s) omitted by template.", snapshot.articles.len()));
        },
        TemplateVariant::Default => {
            for article in &snapshot.articles {
                article_lines(article, &mut lines);
            }
            if let Some(dropped) = snapshot.truncated_articles {
                lines.push(format!("({dropped} further article(s) truncated by policy.)"));
            }
        },
    }
    lines
}

/// Escapes a text line for a PDF literal string (latin-1 byte output;
/// characters outside latin-1 degrade to `?`).
fn escape_pdf_string(line: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + 4);
    for ch in line.chars() {
        match ch {
            '(' | ')' | '\\' => {
                out.push(b'\\');
                out.push(ch as u8);
            },
            ch if (ch as u32) < 256 => out.push(ch as u8),
            _ => out.push(b'?'),
        }
    }
    out
}

struct ObjectWriter {
    buffer: Vec<u8>,
    offsets: Vec<(u32, usize)>,
}

impl ObjectWriter {
    fn new() -> Self {
        Self {
            buffer: b"%PDF-1.7\n%\xc2\xb5\xc2\xb6\n".to_vec(),
            offsets: Vec::new(),
        }
    }

    fn add_object(&mut self, number: u32, body: &[u8]) {
        self.offsets.push((number, self.buffer.len()));
        self.buffer
            .extend_from_slice(format!("{number} 0 obj\n").as_bytes());
        self.buffer.extend_from_slice(body);
        self.buffer.extend_from_slice(b"\nendobj\n");
    }

    fn finish(mut self, root: u32) -> Vec<u8> {
        self.offsets.sort_by_key(|(number, _)| *number);
        let xref_offset = self.buffer.len();
        let count = self.offsets.len() as u32 + 1;
        self.buffer
            .extend_from_slice(format!("xref\n0 {count}\n").as_bytes());
        self.buffer
            .extend_from_slice(b"0000000000 65535 f \n");
        for (_, offset) in &self.offsets {
            self.buffer
                .extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
        }
        self.buffer.extend_from_slice(
            format!("trailer\n<< /Size {count} /Root {root} 0 R >>\nstartxref\n{xref_offset}\n%%EOF\n")
                .as_bytes(),
        );
        self.buffer
    }
}

fn content_stream(lines: &[String]) -> Vec<u8> {
    let mut stream = Vec::new();
    stream.extend_from_slice(
        format!(
            "BT\n/F1 {FONT_SIZE} Tf\n{LEADING} TL\n{MARGIN} {} Td\n",
            PAGE_HEIGHT - MARGIN
        )
        .as_bytes(),
    );
    for (idx, line) in lines.iter().enumerate() {
        if idx > 0 {
            stream.extend_from_slice(b"T*\n");
        }
        stream.push(b'(');
        stream.extend_from_slice(&escape_pdf_string(line));
        stream.extend_from_slice(b") Tj\n");
    }
    stream.extend_from_slice(b"ET\n");
    stream
}

impl PdfRenderer for TextPdfRenderer {
    fn render(&self, snapshot: &Snapshot, options: &RenderOptions) -> Result<Vec<u8>, JobError> {
        let lines = document_lines(snapshot, options);
        let pages: Vec<&[String]> = if lines.is_empty() {
            vec![&[]]
        } else {
            lines.chunks(LINES_PER_PAGE).collect()
        };
        let page_count = pages.len();
        if page_count > 10_000 {
            return Err(JobError::permanent(
                ErrorCode::Render,
                format!("rendition would produce {page_count} pages"),
            ));
        }

        let first_page_obj = 4u32;
        let after_pages = first_page_obj + 2 * page_count as u32;
        let (acroform_obj, field_obj, sigval_obj) = (after_pages, after_pages + 1, after_pages + 2);

        let mut writer = ObjectWriter::new();

        let catalog = if options.prepare_signature_field {
            format!("<< /Type /Catalog /Pages 2 0 R /AcroForm {acroform_obj} 0 R >>")
        } else {
            "<< /Type /Catalog /Pages 2 0 R >>".to_owned()
        };
        writer.add_object(1, catalog.as_bytes());

        let kids: Vec<String> = (0..page_count)
            .map(|idx| format!("{} 0 R", first_page_obj + 2 * idx as u32))
            .collect();
        writer.add_object(
            2,
            format!(
                "<< /Type /Pages /Kids [{}] /Count {page_count} >>",
                kids.join(" ")
            )
            .as_bytes(),
        );
        writer.add_object(
            3,
            b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>",
        );

        for (idx, page_lines) in pages.iter().enumerate() {
            let page_obj = first_page_obj + 2 * idx as u32;
            let stream_obj = page_obj + 1;

            let annots = if options.prepare_signature_field && idx == 0 {
                format!(" /Annots [{field_obj} 0 R]")
            } else {
                String::new()
            };
            writer.add_object(
                page_obj,
                format!(
                    "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {PAGE_WIDTH} {PAGE_HEIGHT}] \
                     /Resources << /Font << /F1 3 0 R >> >> /Contents {stream_obj} 0 R{annots} >>"
                )
                .as_bytes(),
            );

            let stream = content_stream(page_lines);
            let mut body = format!("<< /Length {} >>\nstream\n", stream.len()).into_bytes();
            body.extend_from_slice(&stream);
            body.extend_from_slice(b"endstream");
            writer.add_object(stream_obj, &body);
        }

        if options.prepare_signature_field {
            writer.add_object(
                acroform_obj,
                format!("<< /Fields [{field_obj} 0 R] /SigFlags 3 >>").as_bytes(),
            );
            writer.add_object(
                field_obj,
                format!(
                    "<< /Type /Annot /Subtype /Widget /FT /Sig /T (Signature1) /Rect [0 0 0 0] \
                     /F 132 /P {first_page_obj} 0 R /V {sigval_obj} 0 R >>"
                )
                .as_bytes(),
            );

            let stamp = options.generated_at.format("D:%Y%m%d%H%M%SZ");
            let mut sigval = format!(
                "<< /Type /Sig /Filter /Adobe.PPKLite /SubFilter /ETSI.CAdES.detached \
                 {} {} /Reason (",
                byte_range_placeholder(),
                contents_placeholder(),
            )
            .into_bytes();
            sigval.extend_from_slice(&escape_pdf_string(&options.signature_reason));
            sigval.extend_from_slice(b") /Location (");
            sigval.extend_from_slice(&escape_pdf_string(&options.signature_location));
            sigval.extend_from_slice(format!(") /M ({stamp}) >>").as_bytes());
            writer.add_object(sigval_obj, &sigval);
        }

        Ok(writer.finish(1))
    }
}
