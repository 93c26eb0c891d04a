//! PKCS#12 signing material.
//!
//! The bundle is loaded once at startup (fail-fast on a missing file or a
//! wrong password) and shared between jobs. The certificate validity
//! window is re-checked at sign time, not just at load time, because the
//! process can outlive the certificate.

use std::path::Path;

use chrono::{DateTime, Utc};
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use secrecy::{ExposeSecret, SecretString};

use super::SigningError;

/// Loaded signer key and certificate.
#[derive(Debug)]
pub struct SigningMaterial {
    pkey: PKey<Private>,
    cert: X509,
    cert_der: Vec<u8>,
    fingerprint: String,
}

impl SigningMaterial {
    /// Loads a PKCS#12/PFX bundle from disk.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::Material`] for a missing file, a wrong or
    /// missing password, or a bundle without both key and certificate.
    pub fn load(pfx_path: &Path, password: Option<&SecretString>) -> Result<Self, SigningError> {
        let pfx_bytes = std::fs::read(pfx_path).map_err(|err| {
            SigningError::Material(format!("cannot read PFX at {}: {err}", pfx_path.display()))
        })?;

        let pkcs12 = Pkcs12::from_der(&pfx_bytes)
            .map_err(|_| SigningError::Material("PFX bundle is not valid PKCS#12 DER".to_owned()))?;
        let password = password.map(ExposeSecret::expose_secret).unwrap_or_default();
        let parsed = pkcs12.parse2(password).map_err(|_| {
            SigningError::Material(
                "failed to open PKCS#12 bundle (wrong password or corrupted file)".to_owned(),
            )
        })?;

        let pkey = parsed.pkey.ok_or_else(|| {
            SigningError::Material("PKCS#12 bundle contains no private key".to_owned())
        })?;
        let cert = parsed.cert.ok_or_else(|| {
            SigningError::Material("PKCS#12 bundle contains no certificate".to_owned())
        })?;

        let cert_der = cert
            .to_der()
            .map_err(|err| SigningError::Material(format!("cannot serialise certificate: {err}")))?;
        let fingerprint = cert
            .digest(MessageDigest::sha256())
            .map(|digest| hex::encode(digest.as_ref()))
            .map_err(|err| SigningError::Material(format!("cannot fingerprint certificate: {err}")))?;

        Ok(Self {
            pkey,
            cert,
            cert_der,
            fingerprint,
        })
    }

    /// Builds material from an in-memory key and certificate (test hook).
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::Material`] when the certificate cannot be
    /// serialised.
    pub fn from_parts(pkey: PKey<Private>, cert: X509) -> Result<Self, SigningError> {
        let cert_der = cert
            .to_der()
            .map_err(|err| SigningError::Material(format!("cannot serialise certificate: {err}")))?;
        let fingerprint = cert
            .digest(MessageDigest::sha256())
            .map(|digest| hex::encode(digest.as_ref()))
            .map_err(|err| SigningError::Material(format!("cannot fingerprint certificate: {err}")))?;
        Ok(Self {
            pkey,
            cert,
            cert_der,
            fingerprint,
        })
    }

    /// Verifies `not_before ≤ now ≤ not_after`.
    ///
    /// A certificate whose `not_after` equals `now` is still accepted.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::Material`] when the window check cannot be
    /// evaluated or the certificate is outside its validity window.
    pub fn verify_validity_window(&self, now: DateTime<Utc>) -> Result<(), SigningError> {
        use std::cmp::Ordering;

        let asn1_now = openssl::asn1::Asn1Time::from_unix(now.timestamp())
            .map_err(|err| SigningError::Material(format!("cannot convert time: {err}")))?;

        let not_before = self
            .cert
            .not_before()
            .compare(&asn1_now)
            .map_err(|err| SigningError::Material(format!("cannot compare notBefore: {err}")))?;
        if not_before == Ordering::Greater {
            return Err(SigningError::Material(
                "signing certificate is not yet valid".to_owned(),
            ));
        }

        let not_after = self
            .cert
            .not_after()
            .compare(&asn1_now)
            .map_err(|err| SigningError::Material(format!("cannot compare notAfter: {err}")))?;
        if not_after == Ordering::Less {
            return Err(SigningError::Material(
                "signing certificate has expired".to_owned(),
            ));
        }
        Ok(())
    }

    /// The private key.
    #[must_use]
    pub fn pkey(&self) -> &PKey<Private> {
        &self.pkey
    }

    /// The signer certificate.
    #[must_use]
    pub fn cert(&self) -> &X509 {
        &self.cert
    }

    /// The DER encoding of the signer certificate.
    #[must_use]
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Lowercase hex SHA-256 of the DER-encoded certificate.
    #[must_use]
    pub fn cert_fingerprint(&self) -> &str {
        &self.fingerprint
    }
}


#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::test_support::self_signed;
    use super::*;

    #[test]
    fn valid_window_is_accepted() {
        let (pkey, cert) = self_signed(30);
        let material = SigningMaterial::from_parts(pkey, cert).unwrap();
        material.verify_validity_window(Utc::now()).unwrap();
    }

    #[test]
    fn expired_certificate_is_rejected() {
        let (pkey, cert) = self_signed(-1);
        let material = SigningMaterial::from_parts(pkey, cert).unwrap();
        let err = material.verify_validity_window(Utc::now()).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn future_certificate_is_rejected() {
        let (pkey, cert) = self_signed(30);
        let material = SigningMaterial::from_parts(pkey, cert).unwrap();
        let err = material
            .verify_validity_window(Utc::now() - Duration::days(2))
            .unwrap_err();
        assert!(err.to_string().contains("not yet valid"));
    }

    #[test]
    fn fingerprint_is_lowercase_hex_of_der() {
        let (pkey, cert) = self_signed(30);
        let der = cert.to_der().unwrap();
        let material = SigningMaterial::from_parts(pkey, cert).unwrap();

        let expected = crate::audit::compute_sha256(&der);
        assert_eq!(material.cert_fingerprint(), expected);
        assert_eq!(material.cert_der(), der.as_slice());
    }

    #[test]
    fn missing_pfx_file_is_a_material_error() {
        let err = SigningMaterial::load(Path::new("/nonexistent/bundle.pfx"), None).unwrap_err();
        assert!(matches!(err, SigningError::Material(_)));
    }
}
