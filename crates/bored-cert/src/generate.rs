//! Certificate generation for the agent identity
//!
//! Produces an ECDSA P-256 client certificate, self-issued unless a signing
//! CA is configured.

use crate::{IdentityError, KeyPair};
use chrono::Utc;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use std::path::Path;
use tracing::debug;

/// Validity period for agent certificates (1 year)
pub const CERT_VALIDITY_DAYS: i64 = 365;

/// Organization written into every agent certificate
pub const CERT_ORGANIZATION: &str = "bored-agent";

/// CA used to sign agent certificates instead of self-issuing them
#[derive(Clone)]
pub struct CertificateSigner {
    ca_cert_pem: String,
    ca_key_pem: String,
}

impl CertificateSigner {
    pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str) -> Result<Self, IdentityError> {
        let signer = Self {
            ca_cert_pem: ca_cert_pem.to_string(),
            ca_key_pem: ca_key_pem.to_string(),
        };
        // fail at startup rather than on first generation
        signer.load()?;
        Ok(signer)
    }

    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self, IdentityError> {
        let read = |path: &Path| {
            std::fs::read_to_string(path).map_err(|e| {
                IdentityError::InvalidCredentials(format!(
                    "failed to read signer file {}: {}",
                    path.display(),
                    e
                ))
            })
        };
        Self::from_pem(&read(cert_path)?, &read(key_path)?)
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    fn load(&self) -> Result<(rcgen::Certificate, rcgen::KeyPair), IdentityError> {
        let ca_key = rcgen::KeyPair::from_pem(&self.ca_key_pem).map_err(|e| {
            IdentityError::InvalidCredentials(format!("failed to parse signer key: {}", e))
        })?;
        let ca_params = CertificateParams::from_ca_cert_pem(&self.ca_cert_pem).map_err(|e| {
            IdentityError::InvalidCredentials(format!("failed to parse signer certificate: {}", e))
        })?;
        // Re-signing with the same key and subject yields an equivalent issuer
        let ca_cert = ca_params.self_signed(&ca_key).map_err(|e| {
            IdentityError::InvalidCredentials(format!("failed to load signer: {}", e))
        })?;
        Ok((ca_cert, ca_key))
    }
}

impl std::fmt::Debug for CertificateSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateSigner")
            .field("ca_key", &"<redacted>")
            .finish()
    }
}

/// Generate a fresh key pair for `namespace`
pub fn generate_keypair(
    namespace: &str,
    signer: Option<&CertificateSigner>,
) -> Result<KeyPair, IdentityError> {
    let params = client_params(namespace)?;

    let key = rcgen::KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| IdentityError::Generation(format!("failed to generate key: {}", e)))?;

    let certificate_pem = match signer {
        Some(signer) => {
            let (ca_cert, ca_key) = signer.load()?;
            let cert = params
                .signed_by(&key, &ca_cert, &ca_key)
                .map_err(|e| IdentityError::Generation(format!("failed to sign certificate: {}", e)))?;
            // leaf followed by the issuing CA
            format!("{}{}", cert.pem(), signer.ca_cert_pem)
        }
        None => params
            .self_signed(&key)
            .map_err(|e| IdentityError::Generation(format!("failed to self-sign certificate: {}", e)))?
            .pem(),
    };

    debug!(namespace, signed = signer.is_some(), "Generated agent certificate");

    Ok(KeyPair::new(
        key.serialize_pem().into_bytes(),
        certificate_pem.into_bytes(),
        namespace,
        Utc::now(),
    ))
}

fn client_params(namespace: &str) -> Result<CertificateParams, IdentityError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(format!("{}.{}", CERT_ORGANIZATION, namespace)),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(CERT_ORGANIZATION.to_string()),
    );
    dn.push(
        DnType::OrganizationalUnitName,
        DnValue::Utf8String(namespace.to_string()),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    Ok(params)
}
