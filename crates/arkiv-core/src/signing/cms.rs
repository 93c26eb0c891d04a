//! CMS `SignedData` assembly for the detached PDF signature.
//!
//! The container is built at the DER level so that the RFC3161 token can be
//! carried as an unsigned attribute of the `SignerInfo`. The signed
//! attributes are the CAdES-minimal pair (content-type and message-digest);
//! the signature covers their DER `SET OF` encoding, as RFC 5652 §5.4
//! requires.

use openssl::hash::MessageDigest;
use openssl::pkey::Id;
use openssl::sign::Signer;

use super::der;
use super::material::SigningMaterial;
use super::SigningError;

/// id-data: 1.2.840.113549.1.7.1
const OID_DATA: &[u64] = &[1, 2, 840, 113_549, 1, 7, 1];
/// id-signedData: 1.2.840.113549.1.7.2
const OID_SIGNED_DATA: &[u64] = &[1, 2, 840, 113_549, 1, 7, 2];
/// id-contentType: 1.2.840.113549.1.9.3
const OID_ATTR_CONTENT_TYPE: &[u64] = &[1, 2, 840, 113_549, 1, 9, 3];
/// id-messageDigest: 1.2.840.113549.1.9.4
const OID_ATTR_MESSAGE_DIGEST: &[u64] = &[1, 2, 840, 113_549, 1, 9, 4];
/// id-aa-timeStampToken: 1.2.840.113549.1.9.16.2.14
const OID_ATTR_TIMESTAMP_TOKEN: &[u64] = &[1, 2, 840, 113_549, 1, 9, 16, 2, 14];
/// sha256: 2.16.840.1.101.3.4.2.1
const OID_SHA256: &[u64] = &[2, 16, 840, 1, 101, 3, 4, 2, 1];
/// rsaEncryption: 1.2.840.113549.1.1.1
const OID_RSA: &[u64] = &[1, 2, 840, 113_549, 1, 1, 1];
/// ecdsa-with-SHA256: 1.2.840.10045.4.3.2
const OID_ECDSA_SHA256: &[u64] = &[1, 2, 840, 10_045, 4, 3, 2];

fn algorithm_sha256() -> Vec<u8> {
    der::sequence(&[&der::oid(OID_SHA256), &der::null()])
}

fn attribute(oid_arcs: &[u64], value: &[u8]) -> Vec<u8> {
    der::sequence(&[&der::oid(oid_arcs), &der::set(&[value])])
}

/// The DER-sorted signed attributes for a content digest.
fn signed_attributes(content_digest: &[u8; 32]) -> Vec<Vec<u8>> {
    let mut attrs = vec![
        attribute(OID_ATTR_CONTENT_TYPE, &der::oid(OID_DATA)),
        attribute(OID_ATTR_MESSAGE_DIGEST, &der::octet_string(content_digest)),
    ];
    // DER SET OF orders elements by their encoding.
    attrs.sort();
    attrs
}

/// Computes the signature over the signed attributes.
///
/// Returns `(signed_attrs, signature)` where `signed_attrs` are the sorted
/// attribute encodings. The signature covers the explicit `SET OF`
/// encoding of those attributes.
///
/// # Errors
///
/// Returns [`SigningError::Failed`] when the key refuses to sign.
pub fn sign_attributes(
    material: &SigningMaterial,
    content_digest: &[u8; 32],
) -> Result<(Vec<Vec<u8>>, Vec<u8>), SigningError> {
    let attrs = signed_attributes(content_digest);
    let attr_refs: Vec<&[u8]> = attrs.iter().map(Vec::as_slice).collect();
    let to_be_signed = der::set(&attr_refs);

    let mut signer = Signer::new(MessageDigest::sha256(), material.pkey())
        .map_err(|err| SigningError::Failed(format!("cannot initialise signer: {err}")))?;
    signer
        .update(&to_be_signed)
        .map_err(|err| SigningError::Failed(format!("cannot hash signed attributes: {err}")))?;
    let signature = signer
        .sign_to_vec()
        .map_err(|err| SigningError::Failed(format!("signing failed: {err}")))?;

    Ok((attrs, signature))
}

fn signature_algorithm(material: &SigningMaterial) -> Result<Vec<u8>, SigningError> {
    match material.pkey().id() {
        Id::RSA => Ok(der::sequence(&[&der::oid(OID_RSA), &der::null()])),
        Id::EC => Ok(der::sequence(&[&der::oid(OID_ECDSA_SHA256)])),
        other => Err(SigningError::Failed(format!(
            "unsupported key type for signing: {other:?}"
        ))),
    }
}

fn issuer_and_serial(material: &SigningMaterial) -> Result<Vec<u8>, SigningError> {
    let issuer = material
        .cert()
        .issuer_name()
        .to_der()
        .map_err(|err| SigningError::Failed(format!("cannot encode issuer name: {err}")))?;
    let serial = material
        .cert()
        .serial_number()
        .to_bn()
        .map(|bn| bn.to_vec())
        .map_err(|err| SigningError::Failed(format!("cannot encode serial number: {err}")))?;
    Ok(der::sequence(&[&issuer, &der::integer(&serial)]))
}

/// Assembles the detached `SignedData` `ContentInfo`.
///
/// `timestamp_token`, when present, is embedded as the
/// `id-aa-timeStampToken` unsigned attribute of the single `SignerInfo`.
///
/// # Errors
///
/// Returns [`SigningError::Failed`] when any certificate field cannot be
/// encoded.
pub fn assemble_signed_data(
    material: &SigningMaterial,
    signed_attrs: &[Vec<u8>],
    signature: &[u8],
    timestamp_token: Option<&[u8]>,
) -> Result<Vec<u8>, SigningError> {
    let attr_refs: Vec<&[u8]> = signed_attrs.iter().map(Vec::as_slice).collect();
    let signed_attrs_implicit = der::context(0, &attr_refs.concat());

    let mut signer_info_parts: Vec<Vec<u8>> = vec![
        der::integer_u64(1),
        issuer_and_serial(material)?,
        algorithm_sha256(),
        signed_attrs_implicit,
        signature_algorithm(material)?,
        der::octet_string(signature),
    ];
    if let Some(token) = timestamp_token {
        let attr = attribute(OID_ATTR_TIMESTAMP_TOKEN, token);
        signer_info_parts.push(der::tlv(0xa1, &attr));
    }
    let part_refs: Vec<&[u8]> = signer_info_parts.iter().map(Vec::as_slice).collect();
    let signer_info = der::sequence(&part_refs);

    let encap_content_info = der::sequence(&[&der::oid(OID_DATA)]);
    let signed_data = der::sequence(&[
        &der::integer_u64(1),
        &der::set(&[&algorithm_sha256()]),
        &encap_content_info,
        // certificates [0] IMPLICIT: the signer certificate, raw DER.
        &der::context(0, material.cert_der()),
        &der::set(&[&signer_info]),
    ]);

    Ok(der::sequence(&[
        &der::oid(OID_SIGNED_DATA),
        &der::context(0, &signed_data),
    ]))
}

#[cfg(test)]
mod tests {
    use openssl::hash::MessageDigest;
    use openssl::sign::Verifier;
    use sha2::{Digest, Sha256};

    use super::super::material::test_support::self_signed;
    use super::*;

    fn material() -> SigningMaterial {
        let (pkey, cert) = self_signed(30);
        SigningMaterial::from_parts(pkey, cert).unwrap()
    }

    fn digest(data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    #[test]
    fn signature_verifies_over_signed_attr_set() {
        let material = material();
        let content_digest = digest(b"content bytes");
        let (attrs, signature) = sign_attributes(&material, &content_digest).unwrap();

        let attr_refs: Vec<&[u8]> = attrs.iter().map(Vec::as_slice).collect();
        let to_be_signed = der::set(&attr_refs);

        let mut verifier = Verifier::new(MessageDigest::sha256(), material.pkey()).unwrap();
        verifier.update(&to_be_signed).unwrap();
        assert!(verifier.verify(&signature).unwrap());
    }

    #[test]
    fn signed_attrs_carry_the_message_digest() {
        let material = material();
        let content_digest = digest(b"payload");
        let (attrs, _) = sign_attributes(&material, &content_digest).unwrap();

        let needle = der::octet_string(&content_digest);
        assert!(
            attrs.iter().any(|attr| attr
                .windows(needle.len())
                .any(|window| window == needle.as_slice())),
            "message digest attribute missing"
        );
    }

    #[test]
    fn signed_attrs_are_der_sorted() {
        let material = material();
        let (attrs, _) = sign_attributes(&material, &digest(b"x")).unwrap();
        let mut sorted = attrs.clone();
        sorted.sort();
        assert_eq!(attrs, sorted);
    }

    #[test]
    fn signed_data_structure_is_well_formed() {
        let material = material();
        let (attrs, signature) = sign_attributes(&material, &digest(b"pdf")).unwrap();
        let cms = assemble_signed_data(&material, &attrs, &signature, None).unwrap();

        let (content_info, rest) = der::expect_element(&cms, der::TAG_SEQUENCE).unwrap();
        assert!(rest.is_empty());
        let (content_type, body) =
            der::expect_element(content_info.content, der::TAG_OID).unwrap();
        assert_eq!(content_type.content, &der::oid(OID_SIGNED_DATA)[2..]);

        let (explicit, _) = der::expect_element(body, 0xa0).unwrap();
        let (signed_data, _) = der::expect_element(explicit.content, der::TAG_SEQUENCE).unwrap();
        let (version, rest) = der::expect_element(signed_data.content, der::TAG_INTEGER).unwrap();
        assert_eq!(version.content, &[1]);
        let (_digest_algs, rest) = der::expect_element(rest, der::TAG_SET).unwrap();
        let (encap, rest) = der::expect_element(rest, der::TAG_SEQUENCE).unwrap();
        // Detached: encapContentInfo carries only the content type.
        let (encap_type, encap_rest) = der::expect_element(encap.content, der::TAG_OID).unwrap();
        assert_eq!(encap_type.content, &der::oid(OID_DATA)[2..]);
        assert!(encap_rest.is_empty());

        let (certs, rest) = der::expect_element(rest, 0xa0).unwrap();
        assert_eq!(certs.content, material.cert_der());

        let (signer_infos, rest) = der::expect_element(rest, der::TAG_SET).unwrap();
        assert!(rest.is_empty());
        let (signer_info, _) =
            der::expect_element(signer_infos.content, der::TAG_SEQUENCE).unwrap();
        assert!(signer_info
            .content
            .windows(signature.len())
            .any(|window| window == signature.as_slice()));
    }

    #[test]
    fn timestamp_token_lands_in_unsigned_attrs() {
        let material = material();
        let (attrs, signature) = sign_attributes(&material, &digest(b"pdf")).unwrap();
        let token = der::sequence(&[&der::oid(OID_SIGNED_DATA)]);

        let without = assemble_signed_data(&material, &attrs, &signature, None).unwrap();
        let with = assemble_signed_data(&material, &attrs, &signature, Some(&token)).unwrap();

        assert!(with.len() > without.len());
        let marker = der::oid(OID_ATTR_TIMESTAMP_TOKEN);
        assert!(with
            .windows(marker.len())
            .any(|window| window == marker.as_slice()));
        assert!(!without
            .windows(marker.len())
            .any(|window| window == marker.as_slice()));
    }
}
