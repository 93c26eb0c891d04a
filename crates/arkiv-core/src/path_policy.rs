//! Path policy: validation, sanitisation, and root containment for
//! untrusted archive path segments.
//!
//! Untrusted input (the `archive_path` custom field, the user segment, and
//! filename pattern tokens) goes through three stages:
//!
//! 1. **Validation** of the raw segments: non-empty after trim, not `.` or
//!    `..`, free of separators and NUL, bounded length and depth.
//! 2. **Sanitisation**: deterministic, idempotent reduction to
//!    `[A-Za-z0-9._-]` (NFKD normalise, strip combining marks, whitespace and
//!    disallowed characters become `_`, underscore runs collapse).
//! 3. **Re-validation** of the sanitised segments, so traversal attempts
//!    that only become `..` after normalisation (e.g. fullwidth dots) are
//!    rejected rather than laundered.
//!
//! The final assembled path must resolve to a strict descendant of the
//! storage root. Nothing in this module touches the filesystem except the
//! root resolution in [`ensure_within_root`]; writes happen in the storage
//! layer which re-validates.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::error::{ErrorCode, JobError};

/// Maximum number of archive path segments (excluding user segment and
/// filename).
pub const MAX_DEPTH: usize = 10;

/// Maximum byte length of a single path segment after sanitisation.
pub const MAX_SEGMENT_BYTES: usize = 64;

/// Maximum byte length of the rendered filename.
pub const MAX_FILENAME_BYTES: usize = 255;

/// A path policy violation. Always a permanent failure.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PathPolicyError(pub String);

impl From<PathPolicyError> for JobError {
    fn from(err: PathPolicyError) -> Self {
        Self::permanent(ErrorCode::PathPolicy, err.0)
    }
}

fn policy_err(message: impl Into<String>) -> PathPolicyError {
    PathPolicyError(message.into())
}

/// Produces a filesystem-safe path segment.
///
/// The transformation is deterministic and idempotent:
/// `sanitize_segment(sanitize_segment(s)) == sanitize_segment(s)`.
///
/// Non-ASCII characters that survive NFKD decomposition become `_` rather
/// than vanishing, so a segment never becomes empty just because it
/// contained only CJK text or emoji. A non-empty input that sanitises to
/// nothing yields a single `_`.
#[must_use]
pub fn sanitize_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut last_was_underscore = false;

    for ch in segment.nfkd() {
        if is_combining_mark(ch) {
            continue;
        }
        let mapped = if ch.is_ascii() {
            if ch.is_ascii_whitespace() {
                '_'
            } else if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        } else {
            '_'
        };

        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped);
    }

    if !segment.is_empty() && out.is_empty() {
        out.push('_');
    }
    out
}

/// Validates a single segment against the reserved-name and length rules.
fn validate_segment(segment: &str, max_length: usize) -> Result<(), PathPolicyError> {
    if segment.trim().is_empty() {
        return Err(policy_err("empty path segment is not allowed"));
    }
    if segment == "." || segment == ".." {
        return Err(policy_err("dot segments are not allowed"));
    }
    if segment.contains('\0') {
        return Err(policy_err("null bytes are not allowed"));
    }
    if segment.contains('/') || segment.contains('\\') {
        return Err(policy_err("path separators are not allowed in segments"));
    }
    if segment.len() > max_length {
        return Err(policy_err(format!(
            "path segment too long (max {max_length} bytes)"
        )));
    }
    Ok(())
}

/// Validates a sequence of segments: depth cap plus per-segment rules.
///
/// # Errors
///
/// Returns [`PathPolicyError`] when the depth cap or any segment rule is
/// violated.
pub fn validate_segments<S: AsRef<str>>(
    segments: &[S],
    max_depth: usize,
    max_length: usize,
) -> Result<(), PathPolicyError> {
    if segments.len() > max_depth {
        return Err(policy_err(format!(
            "too many path segments (max depth {max_depth})"
        )));
    }
    for segment in segments {
        validate_segment(segment.as_ref(), max_length)?;
    }
    Ok(())
}

/// Parses the raw `archive_path` custom field value.
///
/// The field is either a string of `>`-separated segments or a JSON array of
/// strings. Blank segments are dropped; an effectively empty path is an
/// error.
///
/// # Errors
///
/// Returns [`PathPolicyError`] when the value is missing, has the wrong
/// type, or contains no non-blank segment.
pub fn parse_archive_path(value: Option<&serde_json::Value>) -> Result<Vec<String>, PathPolicyError> {
    let value = value.ok_or_else(|| policy_err("custom field archive_path is missing"))?;

    let parts: Vec<String> = match value {
        serde_json::Value::String(raw) => raw
            .split('>')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(ToOwned::to_owned)
            .collect(),
        serde_json::Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for (idx, item) in items.iter().enumerate() {
                let serde_json::Value::String(raw) = item else {
                    return Err(policy_err(format!("archive_path[{idx}] must be a string")));
                };
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_owned());
                }
            }
            parts
        },
        _ => {
            return Err(policy_err(
                "archive_path must be a string or a list of strings",
            ))
        },
    };

    if parts.is_empty() {
        return Err(policy_err(
            "archive_path must contain at least one non-empty segment",
        ));
    }
    Ok(parts)
}

/// Splits an allow-list prefix entry; both `>` and `/` are accepted as
/// separators in configuration.
fn parse_prefix_segments(prefix: &str) -> Result<Vec<String>, PathPolicyError> {
    let parts: Vec<String> = prefix
        .split(['>', '/'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToOwned::to_owned)
        .collect();
    if parts.is_empty() {
        return Err(policy_err("allow_prefixes entry produced no segments"));
    }
    Ok(parts)
}

/// Builds the deterministic target directory
/// `root / <sanitised user> / <sanitised segments...>`.
///
/// Raw inputs are validated, sanitised, and re-validated; the prefix
/// allow-list (when configured) is compared against the sanitised segments.
/// An explicitly configured empty allow-list means "no path allowed"; an
/// absent allow-list means "no restriction".
///
/// # Errors
///
/// Returns [`PathPolicyError`] on any validation failure, disallowed prefix,
/// or root escape.
pub fn build_target_dir(
    root: &Path,
    username: &str,
    segments: &[String],
    allow_prefixes: Option<&[String]>,
) -> Result<PathBuf, PathPolicyError> {
    validate_segments(&[username], 1, MAX_SEGMENT_BYTES)?;
    validate_segments(segments, MAX_DEPTH, MAX_SEGMENT_BYTES)?;

    let user_safe = sanitize_segment(username);
    let segments_safe: Vec<String> = segments.iter().map(|s| sanitize_segment(s)).collect();

    validate_segments(&[user_safe.as_str()], 1, MAX_SEGMENT_BYTES)?;
    validate_segments(&segments_safe, MAX_DEPTH, MAX_SEGMENT_BYTES)?;

    if let Some(prefixes) = allow_prefixes {
        if prefixes.is_empty() {
            return Err(policy_err("allow_prefixes is empty: no path is allowed"));
        }
        let mut matched = false;
        for prefix in prefixes {
            let parts = parse_prefix_segments(prefix)?;
            validate_segments(&parts, MAX_DEPTH, MAX_SEGMENT_BYTES)?;
            let parts_safe: Vec<String> = parts.iter().map(|p| sanitize_segment(p)).collect();
            validate_segments(&parts_safe, MAX_DEPTH, MAX_SEGMENT_BYTES)?;
            if segments_safe.len() >= parts_safe.len()
                && segments_safe[..parts_safe.len()] == parts_safe[..]
            {
                matched = true;
                break;
            }
        }
        if !matched {
            return Err(policy_err(
                "archive_path is not allowed by the allow_prefixes policy",
            ));
        }
    }

    let mut target = root.join(&user_safe);
    for segment in &segments_safe {
        target.push(segment);
    }

    ensure_within_root(root, &target)?;
    Ok(target)
}

/// Renders the configured filename pattern.
///
/// Supported placeholders: `{ticket_number}`, `{timestamp_utc}` and its
/// alias `{date_utc}` (UTC `YYYY-MM-DD`). Token values are sanitised; the
/// rendered name must be a single segment of at most
/// [`MAX_FILENAME_BYTES`] bytes.
///
/// # Errors
///
/// Returns [`PathPolicyError`] on unknown placeholders, separators in the
/// output, or length violations.
pub fn build_filename(
    pattern: &str,
    ticket_number: &str,
    date_utc: &str,
) -> Result<String, PathPolicyError> {
    if pattern.trim().is_empty() {
        return Err(policy_err("filename_pattern must be a non-empty string"));
    }

    let ticket_safe = sanitize_segment(ticket_number);
    let date_safe = sanitize_segment(date_utc);

    let rendered = pattern
        .replace("{ticket_number}", &ticket_safe)
        .replace("{timestamp_utc}", &date_safe)
        .replace("{date_utc}", &date_safe);

    if rendered.contains('{') || rendered.contains('}') {
        return Err(policy_err(
            "filename_pattern contains an unknown placeholder",
        ));
    }

    let rendered = rendered.trim().to_owned();
    if rendered.is_empty() {
        return Err(policy_err("filename_pattern produced an empty filename"));
    }
    if rendered.contains('/') || rendered.contains('\\') || rendered.contains('\0') {
        return Err(policy_err(
            "filename_pattern must not produce separators or null bytes",
        ));
    }
    validate_segments(&[rendered.as_str()], 1, MAX_FILENAME_BYTES)?;
    Ok(rendered)
}

/// Normalises a path lexically: `.` components vanish, `..` pops, and any
/// pop past the start is an escape.
fn lexical_resolve(path: &Path) -> Result<PathBuf, PathPolicyError> {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(policy_err("target path escapes root"));
                }
            },
            other => resolved.push(other.as_os_str()),
        }
    }
    Ok(resolved)
}

/// Verifies that `target` resolves to a descendant of `root`.
///
/// The root is resolved through symlinks when it exists (operators commonly
/// point the storage root at a mounted share); the target below it is
/// resolved lexically only - symlinks under the root are the storage
/// layer's concern.
///
/// # Errors
///
/// Returns [`PathPolicyError`] when the target escapes the root.
pub fn ensure_within_root(root: &Path, target: &Path) -> Result<(), PathPolicyError> {
    let root_resolved = match std::fs::canonicalize(root) {
        Ok(path) => path,
        Err(_) => lexical_resolve(root)?,
    };

    // Rebase the target onto the resolved root before normalising, so the
    // escape check operates in one coordinate space.
    let rebased = match target.strip_prefix(root) {
        Ok(relative) => root_resolved.join(relative),
        Err(_) => target.to_path_buf(),
    };
    let target_resolved = lexical_resolve(&rebased)?;

    if target_resolved.starts_with(&root_resolved) && target_resolved != root_resolved {
        Ok(())
    } else {
        Err(policy_err("target path escapes root"))
    }
}
