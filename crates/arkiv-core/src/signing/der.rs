//! Minimal DER encoding and reading.
//!
//! Just enough ASN.1 to assemble the CMS `SignedData` container and the
//! RFC3161 request, and to structurally validate the RFC3161 response. All
//! encoders produce definite-length DER; the reader rejects indefinite
//! lengths and truncated values.

/// Universal tag numbers used here.
pub const TAG_BOOLEAN: u8 = 0x01;
/// INTEGER.
pub const TAG_INTEGER: u8 = 0x02;
/// OCTET STRING.
pub const TAG_OCTET_STRING: u8 = 0x04;
/// NULL.
pub const TAG_NULL: u8 = 0x05;
/// OBJECT IDENTIFIER.
pub const TAG_OID: u8 = 0x06;
/// UTF8String.
pub const TAG_UTF8_STRING: u8 = 0x0c;
/// SEQUENCE (constructed).
pub const TAG_SEQUENCE: u8 = 0x30;
/// SET (constructed).
pub const TAG_SET: u8 = 0x31;

/// Encodes a definite length.
fn encode_len(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    let significant = &bytes[first..];
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
}

/// Encodes one tag-length-value element.
#[must_use]
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    encode_len(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

/// Encodes a SEQUENCE from already-encoded children.
#[must_use]
pub fn sequence(children: &[&[u8]]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, &children.concat())
}

/// Encodes a SET from already-encoded children.
#[must_use]
pub fn set(children: &[&[u8]]) -> Vec<u8> {
    tlv(TAG_SET, &children.concat())
}

/// Encodes a context-specific constructed element `[n]`.
#[must_use]
pub fn context(tag_number: u8, content: &[u8]) -> Vec<u8> {
    tlv(0xa0 | tag_number, content)
}

/// Encodes an OBJECT IDENTIFIER from its arc components.
///
/// # Panics
///
/// Panics when fewer than two arcs are given; OIDs in this crate are
/// compile-time constants.
#[must_use]
pub fn oid(arcs: &[u64]) -> Vec<u8> {
    assert!(arcs.len() >= 2, "an OID needs at least two arcs");
    let mut body = Vec::new();
    body.push((arcs[0] * 40 + arcs[1]) as u8);
    for &arc in &arcs[2..] {
        let mut chunk = [0u8; 10];
        let mut idx = chunk.len();
        let mut value = arc;
        loop {
            idx -= 1;
            chunk[idx] = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                break;
            }
        }
        for (pos, byte) in chunk[idx..].iter().enumerate() {
            let last = pos == chunk.len() - idx - 1;
            body.push(if last { *byte } else { byte | 0x80 });
        }
    }
    tlv(TAG_OID, &body)
}

/// Encodes an INTEGER from a big-endian magnitude (interpreted unsigned).
#[must_use]
pub fn integer(magnitude: &[u8]) -> Vec<u8> {
    let first = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len().saturating_sub(1));
    let significant = if magnitude.is_empty() {
        &[0u8][..]
    } else {
        &magnitude[first..]
    };
    let mut body = Vec::with_capacity(significant.len() + 1);
    if significant.first().is_some_and(|&b| b & 0x80 != 0) {
        body.push(0);
    }
    body.extend_from_slice(significant);
    if body.is_empty() {
        body.push(0);
    }
    tlv(TAG_INTEGER, &body)
}

/// Encodes a small non-negative INTEGER.
#[must_use]
pub fn integer_u64(value: u64) -> Vec<u8> {
    integer(&value.to_be_bytes())
}

/// Encodes an OCTET STRING.
#[must_use]
pub fn octet_string(content: &[u8]) -> Vec<u8> {
    tlv(TAG_OCTET_STRING, content)
}

/// Encodes a BOOLEAN.
#[must_use]
pub fn boolean(value: bool) -> Vec<u8> {
    tlv(TAG_BOOLEAN, &[if value { 0xff } else { 0x00 }])
}

/// Encodes a NULL.
#[must_use]
pub fn null() -> Vec<u8> {
    tlv(TAG_NULL, &[])
}

/// One decoded element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element<'a> {
    /// The full tag byte.
    pub tag: u8,
    /// The content octets.
    pub content: &'a [u8],
}

/// A decode failure (truncated, indefinite, or oversized length).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("malformed DER: {0}")]
pub struct DerError(pub &'static str);

/// Reads one TLV element; returns it and the remaining bytes.
///
/// # Errors
///
/// Returns [`DerError`] on truncation or an indefinite/oversized length.
pub fn read_element(input: &[u8]) -> Result<(Element<'_>, &[u8]), DerError> {
    if input.len() < 2 {
        return Err(DerError("truncated header"));
    }
    let tag = input[0];
    let (len, header_len) = if input[1] < 0x80 {
        (input[1] as usize, 2)
    } else {
        let count = (input[1] & 0x7f) as usize;
        if count == 0 {
            return Err(DerError("indefinite length"));
        }
        if count > 4 || input.len() < 2 + count {
            return Err(DerError("oversized length"));
        }
        let mut len = 0usize;
        for &byte in &input[2..2 + count] {
            len = (len << 8) | byte as usize;
        }
        (len, 2 + count)
    };
    if input.len() < header_len + len {
        return Err(DerError("truncated content"));
    }
    Ok((
        Element {
            tag,
            content: &input[header_len..header_len + len],
        },
        &input[header_len + len..],
    ))
}

/// Reads one element and requires its tag.
///
/// # Errors
///
/// Returns [`DerError`] on decode failure or a tag mismatch.
pub fn expect_element(input: &[u8], tag: u8) -> Result<(Element<'_>, &[u8]), DerError> {
    let (element, rest) = read_element(input)?;
    if element.tag == tag {
        Ok((element, rest))
    } else {
        Err(DerError("unexpected tag"))
    }
}
