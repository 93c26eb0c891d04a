//! Allow-list HTML sanitisation for article bodies.
//!
//! The sanitiser is deliberately strict: it exists to neutralise active
//! content before ticket HTML is rendered into a PDF, not to preserve
//! arbitrary markup. Unknown tags are dropped (their text content kept),
//! `<script>`-like elements are dropped with their content, attributes are
//! stripped except for a tiny per-tag allow-list, and `href` values must
//! carry a safe scheme.
//!
//! On any parse anomaly the sanitiser fails closed by emitting nothing for
//! the anomalous region; callers fall back to the plain-text body when the
//! result is empty.

use std::collections::HashMap;

/// Tags that survive sanitisation.
const ALLOWED_TAGS: &[&str] = &[
    "a", "b", "blockquote", "br", "code", "div", "em", "h1", "h2", "h3", "h4", "h5", "h6", "hr",
    "i", "li", "ol", "p", "pre", "span", "strong", "table", "tbody", "td", "th", "thead", "tr",
    "u", "ul",
];

/// Tags whose entire content is dropped.
const DROP_WITH_CONTENT: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "link", "meta", "base", "form", "input",
    "button", "textarea", "select", "option",
];

const VOID_TAGS: &[&str] = &["br", "hr"];

/// Maximum nesting depth kept in the output.
const MAX_NESTING: usize = 50;

/// Opaque HTML filter applied to every article body.
pub trait HtmlSanitizer: Send + Sync {
    /// Returns the sanitised fragment, or an empty string when nothing
    /// safe remains.
    fn sanitize(&self, html: &str) -> String;
}

/// The built-in allow-list sanitiser.
#[derive(Default)]
pub struct AllowlistSanitizer;

impl HtmlSanitizer for AllowlistSanitizer {
    fn sanitize(&self, html: &str) -> String {
        sanitize_fragment(html)
    }
}

fn allowed_attrs(tag: &str) -> &'static [&'static str] {
    match tag {
        "a" => &["href", "title"],
        "td" | "th" => &["colspan", "rowspan"],
        _ => &[],
    }
}

fn href_is_safe(href: &str) -> bool {
    let href = href.trim();
    if href.is_empty() || href.contains('\0') {
        return false;
    }
    // Scheme-relative URLs smuggle a host without a scheme.
    if href.starts_with("//") {
        return false;
    }
    match href.split_once(':') {
        None => true,
        Some((scheme, _)) => {
            let scheme = scheme.trim().to_ascii_lowercase();
            matches!(scheme.as_str(), "http" | "https" | "mailto")
        },
    }
}

fn escape_text(text: &str, out: &mut String) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
}

struct ParsedTag {
    name: String,
    closing: bool,
    self_closing: bool,
    attrs: HashMap<String, String>,
    /// Byte offset one past the terminating `>`.
    end: usize,
}

/// Parses a tag starting at `start` (which points at `<`). Returns `None`
/// when the region is not a well-formed tag; the caller then treats the
/// `<` as text.
fn parse_tag(input: &str, start: usize) -> Option<ParsedTag> {
    let bytes = input.as_bytes();
    let mut pos = start + 1;

    let closing = bytes.get(pos) == Some(&b'/');
    if closing {
        pos += 1;
    }

    let name_start = pos;
    while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric()) {
        pos += 1;
    }
    if pos == name_start {
        return None;
    }
    let name = input[name_start..pos].to_ascii_lowercase();

    let mut attrs = HashMap::new();
    let mut self_closing = false;
    loop {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        match bytes.get(pos) {
            None => return None,
            Some(b'>') => {
                pos += 1;
                break;
            },
            Some(b'/') => {
                self_closing = true;
                pos += 1;
            },
            Some(_) => {
                let key_start = pos;
                while pos < bytes.len()
                    && !bytes[pos].is_ascii_whitespace()
                    && bytes[pos] != b'='
                    && bytes[pos] != b'>'
                    && bytes[pos] != b'/'
                {
                    pos += 1;
                }
                let key = input[key_start..pos].to_ascii_lowercase();
                let mut value = String::new();
                while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                    pos += 1;
                }
                if bytes.get(pos) == Some(&b'=') {
                    pos += 1;
                    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                        pos += 1;
                    }
                    match bytes.get(pos) {
                        Some(&quote @ (b'"' | b'\'')) => {
                            pos += 1;
                            let value_start = pos;
                            while pos < bytes.len() && bytes[pos] != quote {
                                pos += 1;
                            }
                            if pos >= bytes.len() {
                                return None;
                            }
                            value = input[value_start..pos].to_owned();
                            pos += 1;
                        },
                        _ => {
                            let value_start = pos;
                            while pos < bytes.len()
                                && !bytes[pos].is_ascii_whitespace()
                                && bytes[pos] != b'>'
                            {
                                pos += 1;
                            }
                            value = input[value_start..pos].to_owned();
                        },
                    }
                }
                if !key.is_empty() {
                    attrs.entry(key).or_insert(value);
                }
            },
        }
    }

    Some(ParsedTag {
        name,
        closing,
        self_closing,
        attrs,
        end: pos,
    })
}

fn emit_open_tag(tag: &ParsedTag, out: &mut String) {
    out.push('<');
    out.push_str(&tag.name);
    for attr in allowed_attrs(&tag.name) {
        if let Some(value) = tag.attrs.get(*attr) {
            if *attr == "href" && !href_is_safe(value) {
                continue;
            }
            out.push(' ');
            out.push_str(attr);
            out.push_str("=\"");
            escape_text(value, out);
            out.push('"');
        }
    }
    if VOID_TAGS.contains(&tag.name.as_str()) {
        out.push_str(" />");
    } else {
        out.push('>');
    }
}

/// Sanitises an HTML fragment using the strict allow-list.
#[must_use]
pub fn sanitize_fragment(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut open: Vec<String> = Vec::new();
    let mut skip_depth = 0usize;
    let mut pos = 0usize;
    let bytes = html.as_bytes();

    while pos < bytes.len() {
        if bytes[pos] != b'<' {
            let text_start = pos;
            while pos < bytes.len() && bytes[pos] != b'<' {
                pos += 1;
            }
            if skip_depth == 0 {
                escape_text(&html[text_start..pos], &mut out);
            }
            continue;
        }

        // Comments and declarations are skipped wholesale.
        if html[pos..].starts_with("<!--") {
            pos = html[pos..]
                .find("-->")
                .map_or(bytes.len(), |idx| pos + idx + 3);
            continue;
        }
        if html[pos..].starts_with("<!") || html[pos..].starts_with("<?") {
            pos = html[pos..]
                .find('>')
                .map_or(bytes.len(), |idx| pos + idx + 1);
            continue;
        }

        let Some(tag) = parse_tag(html, pos) else {
            if skip_depth == 0 {
                out.push_str("&lt;");
            }
            pos += 1;
            continue;
        };
        pos = tag.end;

        let dropped = DROP_WITH_CONTENT.contains(&tag.name.as_str());
        if dropped {
            if tag.closing {
                skip_depth = skip_depth.saturating_sub(1);
            } else if !tag.self_closing {
                skip_depth += 1;
            }
            continue;
        }
        if skip_depth > 0 {
            continue;
        }
        if !ALLOWED_TAGS.contains(&tag.name.as_str()) {
            continue;
        }

        if tag.closing {
            if VOID_TAGS.contains(&tag.name.as_str()) {
                continue;
            }
            // Only close a properly nested tag; mismatches are dropped.
            if open.last().map(String::as_str) == Some(tag.name.as_str()) {
                open.pop();
                out.push_str("</");
                out.push_str(&tag.name);
                out.push('>');
            }
        } else {
            if open.len() >= MAX_NESTING {
                continue;
            }
            emit_open_tag(&tag, &mut out);
            if !VOID_TAGS.contains(&tag.name.as_str()) && !tag.self_closing {
                open.push(tag.name);
            }
        }
    }

    // Keep the output well-formed.
    while let Some(tag) = open.pop() {
        out.push_str("</");
        out.push_str(&tag);
        out.push('>');
    }

    out.trim().to_owned()
}

/// Reduces an HTML fragment to plain text: tags vanish, block-level tags
/// become newlines, script/style content is dropped, and common entities
/// are decoded.
#[must_use]
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut skip_depth = 0usize;
    let mut pos = 0usize;
    let bytes = html.as_bytes();

    while pos < bytes.len() {
        if bytes[pos] != b'<' {
            let text_start = pos;
            while pos < bytes.len() && bytes[pos] != b'<' {
                pos += 1;
            }
            if skip_depth == 0 {
                out.push_str(&decode_entities(&html[text_start..pos]));
            }
            continue;
        }
        if html[pos..].starts_with("<!--") {
            pos = html[pos..]
                .find("-->")
                .map_or(bytes.len(), |idx| pos + idx + 3);
            continue;
        }
        let Some(tag) = parse_tag(html, pos) else {
            pos += 1;
            continue;
        };
        pos = tag.end;

        if matches!(tag.name.as_str(), "script" | "style") {
            if tag.closing {
                skip_depth = skip_depth.saturating_sub(1);
            } else if !tag.self_closing {
                skip_depth += 1;
            }
            continue;
        }
        if skip_depth == 0 && matches!(tag.name.as_str(), "p" | "div" | "br" | "li" | "tr") {
            out.push('\n');
        }
    }

    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
