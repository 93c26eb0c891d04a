//! Byte-level signature embedding for prepared PDFs.
//!
//! The renderer emits documents with an invisible signature field whose
//! value dictionary carries two placeholders:
//!
//! - `/ByteRange [...]` - zero-filled, fixed width, patched with the real
//!   offsets before digesting
//! - `/Contents <...>` - a zero-filled hex string sized to hold the DER
//!   CMS container
//!
//! Signing never reflows the document: the digest covers every byte except
//! the `Contents` hex region, exactly as the patched `ByteRange` declares.

use sha2::{Digest, Sha256};

use super::SigningError;

/// Width of each zero-filled `ByteRange` number emitted by the renderer.
pub const BYTE_RANGE_DIGITS: usize = 10;

/// Capacity of the `Contents` placeholder in bytes (hex characters / 2).
pub const CONTENTS_CAPACITY: usize = 8192;

/// The `ByteRange` placeholder exactly as the renderer writes it.
#[must_use]
pub fn byte_range_placeholder() -> String {
    let zeros = "0".repeat(BYTE_RANGE_DIGITS);
    format!("/ByteRange [{zeros} {zeros} {zeros} {zeros}]")
}

/// The `Contents` placeholder exactly as the renderer writes it.
#[must_use]
pub fn contents_placeholder() -> String {
    format!("/Contents <{}>", "0".repeat(CONTENTS_CAPACITY * 2))
}

/// The located placeholder regions of a prepared PDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedRegions {
    /// Byte span of the `[...]` after `/ByteRange`, brackets included.
    pub byte_range: (usize, usize),
    /// Byte span of the `<...>` after `/Contents`, delimiters included.
    pub contents: (usize, usize),
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Locates the signature placeholders in a prepared PDF.
///
/// # Errors
///
/// Returns [`SigningError::Failed`] when the document has no prepared
/// signature field; only renderer-prepared documents can be signed.
pub fn locate_regions(pdf: &[u8]) -> Result<PreparedRegions, SigningError> {
    let missing = || {
        SigningError::Failed(
            "input PDF has no prepared signature field (ByteRange/Contents placeholders)"
                .to_owned(),
        )
    };

    let byte_range_key = find(pdf, b"/ByteRange [", 0).ok_or_else(missing)?;
    let byte_range_open = byte_range_key + b"/ByteRange ".len();
    let byte_range_close = find(pdf, b"]", byte_range_open).ok_or_else(missing)?;

    let contents_key = find(pdf, b"/Contents <", byte_range_close).ok_or_else(missing)?;
    let contents_open = contents_key + b"/Contents ".len();
    let contents_close = find(pdf, b">", contents_open).ok_or_else(missing)?;

    Ok(PreparedRegions {
        byte_range: (byte_range_open, byte_range_close + 1),
        contents: (contents_open, contents_close + 1),
    })
}

/// Patches the `ByteRange`, digests the covered bytes, and returns
/// `(patched_pdf, sha256_digest)`.
///
/// The digest covers `[0, contents_start)` and `[contents_end, len)` - the
/// whole file except the `Contents` hex region.
///
/// # Errors
///
/// Returns [`SigningError::Failed`] when the real offsets do not fit the
/// placeholder width.
pub fn patch_byte_range(
    pdf: &[u8],
    regions: PreparedRegions,
) -> Result<(Vec<u8>, [u8; 32]), SigningError> {
    let (contents_start, contents_end) = regions.contents;
    let (range_start, range_end) = regions.byte_range;

    let ranges = [
        0usize,
        contents_start,
        contents_end,
        pdf.len() - contents_end,
    ];
    let rendered = format!(
        "[{} {} {} {}]",
        ranges[0], ranges[1], ranges[2], ranges[3]
    );
    let slot = range_end - range_start;
    if rendered.len() > slot {
        return Err(SigningError::Failed(
            "ByteRange values exceed the placeholder width".to_owned(),
        ));
    }
    let mut patched = pdf.to_vec();
    let padded = format!("{rendered:<slot$}");
    patched[range_start..range_end].copy_from_slice(padded.as_bytes());

    let mut hasher = Sha256::new();
    hasher.update(&patched[..contents_start]);
    hasher.update(&patched[contents_end..]);
    let digest: [u8; 32] = hasher.finalize().into();

    Ok((patched, digest))
}

/// Writes the DER CMS container into the `Contents` placeholder,
/// zero-padding the remainder of the reserved region.
///
/// # Errors
///
/// Returns [`SigningError::Failed`] when the container exceeds the
/// reserved capacity.
pub fn embed_contents(
    pdf: &mut [u8],
    regions: PreparedRegions,
    cms_der: &[u8],
) -> Result<(), SigningError> {
    let (start, end) = regions.contents;
    // The region includes the '<' and '>' delimiters.
    let capacity_hex = end - start - 2;
    let encoded = hex::encode(cms_der);
    if encoded.len() > capacity_hex {
        return Err(SigningError::Failed(format!(
            "signature container ({} hex chars) exceeds reserved capacity ({capacity_hex})",
            encoded.len()
        )));
    }
    let region = &mut pdf[start + 1..end - 1];
    region[..encoded.len()].copy_from_slice(encoded.as_bytes());
    for byte in &mut region[encoded.len()..] {
        *byte = b'0';
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared_pdf() -> Vec<u8> {
        let mut pdf = Vec::new();
        pdf.extend_from_slice(b"%PDF-1.7\nhead ");
        pdf.extend_from_slice(byte_range_placeholder().as_bytes());
        pdf.extend_from_slice(b" mid ");
        pdf.extend_from_slice(b"/Contents <");
        pdf.extend_from_slice("0".repeat(64).as_bytes());
        pdf.extend_from_slice(b"> tail\n%%EOF\n");
        pdf
    }

    #[test]
    fn locates_placeholder_regions() {
        let pdf = prepared_pdf();
        let regions = locate_regions(&pdf).unwrap();

        let range = &pdf[regions.byte_range.0..regions.byte_range.1];
        assert!(range.starts_with(b"[") && range.ends_with(b"]"));
        let contents = &pdf[regions.contents.0..regions.contents.1];
        assert!(contents.starts_with(b"<") && contents.ends_with(b">"));
        assert_eq!(contents.len(), 64 + 2);
    }

    #[test]
    fn unprepared_pdf_is_rejected() {
        let err = locate_regions(b"%PDF-1.7\nplain document\n%%EOF\n").unwrap_err();
        assert!(matches!(err, SigningError::Failed(_)));
    }

    #[test]
    fn byte_range_patch_covers_everything_but_contents() {
        let pdf = prepared_pdf();
        let regions = locate_regions(&pdf).unwrap();
        let (patched, digest) = patch_byte_range(&pdf, regions).unwrap();
        assert_eq!(patched.len(), pdf.len());

        let text = String::from_utf8_lossy(&patched);
        let (start, end) = regions.contents;
        assert!(text.contains(&format!("[0 {start} {end} {}]", pdf.len() - end)));

        let mut hasher = Sha256::new();
        hasher.update(&patched[..start]);
        hasher.update(&patched[end..]);
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(digest, expected);
    }

    #[test]
    fn embed_fills_and_pads_the_contents_region() {
        let pdf = prepared_pdf();
        let regions = locate_regions(&pdf).unwrap();
        let (mut patched, _) = patch_byte_range(&pdf, regions).unwrap();

        embed_contents(&mut patched, regions, &[0xde, 0xad, 0xbe, 0xef]).unwrap();
        let contents = &patched[regions.contents.0..regions.contents.1];
        let inner = std::str::from_utf8(&contents[1..contents.len() - 1]).unwrap();
        assert!(inner.starts_with("deadbeef"));
        assert!(inner[8..].bytes().all(|b| b == b'0'));
        assert_eq!(inner.len(), 64);
    }

    #[test]
    fn oversized_container_is_rejected() {
        let pdf = prepared_pdf();
        let regions = locate_regions(&pdf).unwrap();
        let (mut patched, _) = patch_byte_range(&pdf, regions).unwrap();

        let err = embed_contents(&mut patched, regions, &[0xaa; 64]).unwrap_err();
        assert!(matches!(err, SigningError::Failed(_)));
    }

    #[test]
    fn placeholders_have_documented_shape() {
        assert_eq!(
            byte_range_placeholder().len(),
            "/ByteRange []".len() + 4 * BYTE_RANGE_DIGITS + 3
        );
        assert!(contents_placeholder().len() > CONTENTS_CAPACITY * 2);
    }
}
