//! PAdES signing of rendered PDFs.
//!
//! The signer consumes a renderer-prepared document (see
//! [`pdf::locate_regions`]), patches the declared byte ranges, produces a
//! detached CMS signature over the covered bytes with the PKCS#12 material,
//! optionally embeds an RFC3161 timestamp over the signature value, and
//! splices the container into the reserved `Contents` region. The
//! signature appearance is invisible.
//!
//! Material problems (missing bundle, wrong password, certificate outside
//! its validity window) and cryptographic failures are permanent; only the
//! TSA exchange can be transient.

pub mod cms;
pub mod der;
pub mod material;
pub mod pdf;

use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::{ErrorCode, JobError};
use crate::tsa::TsaClient;
pub use material::SigningMaterial;

/// Errors from signing.
#[derive(Debug, Error)]
pub enum SigningError {
    /// The signing material is missing, locked, or outside its validity
    /// window.
    #[error("signing material error: {0}")]
    Material(String),

    /// The signing operation itself failed.
    #[error("signing failed: {0}")]
    Failed(String),
}

impl From<SigningError> for JobError {
    fn from(err: SigningError) -> Self {
        match &err {
            SigningError::Material(_) => Self::permanent(ErrorCode::SigningMaterial, err.to_string()),
            SigningError::Failed(_) => Self::permanent(ErrorCode::SigningFailed, err.to_string()),
        }
    }
}

/// Result of a signing pass.
#[derive(Debug)]
pub struct SignedPdf {
    /// The signed document bytes.
    pub bytes: Vec<u8>,
    /// Whether an RFC3161 token was embedded.
    pub tsa_used: bool,
}

/// The PDF signer. Holds loaded material; shared between jobs.
pub struct Signer {
    material: SigningMaterial,
}

impl Signer {
    /// Wraps loaded signing material.
    #[must_use]
    pub fn new(material: SigningMaterial) -> Self {
        Self { material }
    }

    /// The loaded material.
    #[must_use]
    pub fn material(&self) -> &SigningMaterial {
        &self.material
    }

    /// Signs a prepared PDF, embedding a timestamp when a TSA client is
    /// supplied.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`]: permanent for material/cryptographic
    /// failures, and whatever classification the TSA exchange produced
    /// when timestamping is enabled.
    pub async fn sign(
        &self,
        pdf_bytes: &[u8],
        tsa: Option<&TsaClient>,
    ) -> Result<SignedPdf, JobError> {
        if pdf_bytes.is_empty() {
            return Err(SigningError::Failed("cannot sign an empty document".to_owned()).into());
        }
        self.material
            .verify_validity_window(Utc::now())
            .map_err(JobError::from)?;

        let regions = pdf::locate_regions(pdf_bytes).map_err(JobError::from)?;
        let (mut patched, content_digest) =
            pdf::patch_byte_range(pdf_bytes, regions).map_err(JobError::from)?;

        let (signed_attrs, signature) =
            cms::sign_attributes(&self.material, &content_digest).map_err(JobError::from)?;

        let (token, tsa_used) = match tsa {
            Some(client) => {
                let signature_digest: [u8; 32] = Sha256::digest(&signature).into();
                let token = client.stamp(&signature_digest).await.map_err(JobError::from)?;
                (Some(token), true)
            },
            None => (None, false),
        };

        let container = cms::assemble_signed_data(
            &self.material,
            &signed_attrs,
            &signature,
            token.as_deref(),
        )
        .map_err(JobError::from)?;

        pdf::embed_contents(&mut patched, regions, &container).map_err(JobError::from)?;

        Ok(SignedPdf {
            bytes: patched,
            tsa_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::material::test_support::self_signed;
    use super::*;

    fn signer(days_valid: i64) -> Signer {
        let (pkey, cert) = self_signed(days_valid);
        Signer::new(SigningMaterial::from_parts(pkey, cert).unwrap())
    }

    fn prepared_pdf() -> Vec<u8> {
        let mut pdf = Vec::new();
        pdf.extend_from_slice(b"%PDF-1.7\nobjects ");
        pdf.extend_from_slice(pdf::byte_range_placeholder().as_bytes());
        pdf.push(b' ');
        pdf.extend_from_slice(pdf::contents_placeholder().as_bytes());
        pdf.extend_from_slice(b"\n%%EOF\n");
        pdf
    }

    #[tokio::test]
    async fn signs_a_prepared_document() {
        let signer = signer(30);
        let pdf = prepared_pdf();
        let signed = signer.sign(&pdf, None).await.unwrap();

        assert_eq!(signed.bytes.len(), pdf.len());
        assert!(!signed.tsa_used);

        // The container landed inside the contents region.
        let regions = pdf::locate_regions(&pdf).unwrap();
        let contents = &signed.bytes[regions.contents.0 + 1..regions.contents.1 - 1];
        assert!(contents.iter().any(|&b| b != b'0'));
        // And the byte range was patched in.
        let text = String::from_utf8_lossy(&signed.bytes);
        assert!(text.contains(&format!("[0 {}", regions.contents.0)));
    }

    #[tokio::test]
    async fn expired_material_fails_permanently_with_signing_material() {
        let signer = signer(-1);
        let err = signer.sign(&prepared_pdf(), None).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::SigningMaterial));
        assert!(!err.keep_trigger());
    }

    #[tokio::test]
    async fn unprepared_document_fails_with_signing_failed() {
        let signer = signer(30);
        let err = signer
            .sign(b"%PDF-1.7\nno placeholder\n%%EOF\n", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::SigningFailed));
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let signer = signer(30);
        let err = signer.sign(b"", None).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::SigningFailed));
    }

    #[tokio::test]
    async fn signing_is_deterministic_apart_from_the_signature() {
        // Two signing passes over the same input produce containers in the
        // same location with the same framing.
        let signer = signer(30);
        let pdf = prepared_pdf();
        let first = signer.sign(&pdf, None).await.unwrap();
        let second = signer.sign(&pdf, None).await.unwrap();
        let regions = pdf::locate_regions(&pdf).unwrap();

        // Outside the contents region the documents are identical.
        assert_eq!(
            &first.bytes[..regions.contents.0],
            &second.bytes[..regions.contents.0]
        );
        assert_eq!(
            &first.bytes[regions.contents.1..],
            &second.bytes[regions.contents.1..]
        );
    }
}
