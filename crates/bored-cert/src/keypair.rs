//! The agent's TLS client identity

use crate::{IdentityError, CERT_FILE, KEY_FILE};
use chrono::{DateTime, TimeZone, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::path::Path;
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// Private key and certificate issued to the agent for one namespace
///
/// Both halves are PEM encoded. A key pair is never mutated after it has been
/// issued; rotation would mean issuing a new one.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    private_key: Vec<u8>,
    certificate: Vec<u8>,
    namespace: String,
    issued_at: DateTime<Utc>,
}

impl KeyPair {
    pub fn new(
        private_key: Vec<u8>,
        certificate: Vec<u8>,
        namespace: impl Into<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            private_key,
            certificate,
            namespace: namespace.into(),
            issued_at,
        }
    }

    /// Build a key pair from PEM material, taking `issued_at` from the
    /// certificate's notBefore
    pub fn from_pem(
        private_key: Vec<u8>,
        certificate: Vec<u8>,
        namespace: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let mut pair = Self::new(private_key, certificate, namespace, Utc::now());
        pair.validate()?;
        let (not_before, _) = pair.validity()?;
        pair.issued_at = not_before;
        Ok(pair)
    }

    /// Load `tls.crt` and `tls.key` from a credential directory
    ///
    /// Returns `Ok(None)` when either file is missing.
    pub async fn load_from_dir(dir: &Path, namespace: &str) -> Result<Option<Self>, IdentityError> {
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);

        if !cert_path.is_file() || !key_path.is_file() {
            debug!(dir = %dir.display(), "Credential directory has no key pair");
            return Ok(None);
        }

        let certificate = tokio::fs::read(&cert_path).await.map_err(|e| {
            IdentityError::InvalidCredentials(format!(
                "failed to read {}: {}",
                cert_path.display(),
                e
            ))
        })?;
        let private_key = tokio::fs::read(&key_path).await.map_err(|e| {
            IdentityError::InvalidCredentials(format!("failed to read {}: {}", key_path.display(), e))
        })?;

        Self::from_pem(private_key, certificate, namespace).map(Some)
    }

    pub fn private_key_pem(&self) -> &[u8] {
        &self.private_key
    }

    pub fn certificate_pem(&self) -> &[u8] {
        &self.certificate
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Certificate chain in DER form, leaf first
    pub fn certificate_chain(&self) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
        let certs = rustls_pemfile::certs(&mut self.certificate.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                IdentityError::InvalidCredentials(format!("failed to parse certificate: {}", e))
            })?;

        if certs.is_empty() {
            return Err(IdentityError::InvalidCredentials(
                "no certificate found in PEM".to_string(),
            ));
        }

        Ok(certs)
    }

    pub fn private_key_der(&self) -> Result<PrivateKeyDer<'static>, IdentityError> {
        rustls_pemfile::private_key(&mut self.private_key.as_slice())
            .map_err(|e| {
                IdentityError::InvalidCredentials(format!("failed to parse private key: {}", e))
            })?
            .ok_or_else(|| {
                IdentityError::InvalidCredentials("no private key found in PEM".to_string())
            })
    }

    /// Check that both halves parse and the key is usable for signing
    pub fn validate(&self) -> Result<(), IdentityError> {
        let chain = self.certificate_chain()?;
        let key = self.private_key_der()?;

        rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| {
            IdentityError::InvalidCredentials(format!("unsupported private key: {}", e))
        })?;

        X509Certificate::from_der(chain[0].as_ref()).map_err(|e| {
            IdentityError::InvalidCredentials(format!("failed to parse certificate: {}", e))
        })?;

        Ok(())
    }

    /// notBefore and notAfter of the leaf certificate
    pub fn validity(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), IdentityError> {
        let chain = self.certificate_chain()?;
        let (_, cert) = X509Certificate::from_der(chain[0].as_ref()).map_err(|e| {
            IdentityError::InvalidCredentials(format!("failed to parse certificate: {}", e))
        })?;

        let validity = cert.validity();
        Ok((
            timestamp(validity.not_before.timestamp())?,
            timestamp(validity.not_after.timestamp())?,
        ))
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, IdentityError> {
    Utc.timestamp_opt(secs, 0).single().ok_or_else(|| {
        IdentityError::InvalidCredentials(format!("certificate timestamp out of range: {}", secs))
    })
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("namespace", &self.namespace)
            .field("issued_at", &self.issued_at)
            .field("certificate_len", &self.certificate.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}
