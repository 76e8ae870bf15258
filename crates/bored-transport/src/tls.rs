//! TLS configuration shared by the broker and local connectors

use crate::{TransportError, TransportResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::time::ASN1Time;
use x509_parser::x509::SubjectPublicKeyInfo;

/// CA bundle mounted into every pod by the service account admission controller
pub const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring crypto provider as the process default
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Rustls crypto provider already installed");
        }
    });
}

fn supported_algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::ring::default_provider().signature_verification_algorithms
}

/// Load every certificate from a PEM file
pub fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to read {}: {}", path.display(), e))
    })?;

    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

/// Web roots plus any certificates in `extra`
pub fn root_store(extra: &[CertificateDer<'static>]) -> TransportResult<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    for cert in extra {
        roots
            .add(cert.clone())
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid root cert: {}", e)))?;
    }

    Ok(roots)
}

/// Extract the SubjectPublicKeyInfo DER from a `PUBLIC KEY` or `CERTIFICATE` PEM
pub fn parse_public_key_pem(pem: &str) -> TransportResult<Vec<u8>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem.trim().as_bytes())
        .map_err(|e| TransportError::ConfigurationError(format!("Invalid IdP public key: {}", e)))?;

    match pem.label.as_str() {
        "PUBLIC KEY" => {
            SubjectPublicKeyInfo::from_der(&pem.contents).map_err(|e| {
                TransportError::ConfigurationError(format!("Invalid IdP public key: {}", e))
            })?;
            Ok(pem.contents)
        }
        "CERTIFICATE" => {
            let (_, cert) = X509Certificate::from_der(&pem.contents).map_err(|e| {
                TransportError::ConfigurationError(format!("Invalid IdP certificate: {}", e))
            })?;
            Ok(cert.public_key().raw.to_vec())
        }
        other => Err(TransportError::ConfigurationError(format!(
            "Unsupported IdP key PEM label: {}",
            other
        ))),
    }
}

/// Accepts a server certificate only if it carries, or is signed by, the IdP key
///
/// Chain building and host name checks are skipped: trust is anchored in the
/// single IdP key rather than in a CA hierarchy.
#[derive(Debug)]
pub struct IdpCertVerifier {
    idp_spki: Vec<u8>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl IdpCertVerifier {
    pub fn new(idp_spki: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            idp_spki,
            algorithms: supported_algorithms(),
        })
    }

    pub fn from_pem(pem: &str) -> TransportResult<Arc<Self>> {
        Ok(Self::new(parse_public_key_pem(pem)?))
    }

    /// Check an end-entity certificate against the IdP key at time `now`
    pub fn verify_end_entity(&self, end_entity: &[u8], now: UnixTime) -> Result<(), rustls::Error> {
        let (_, cert) = X509Certificate::from_der(end_entity)
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;

        let now = i64::try_from(now.as_secs())
            .ok()
            .and_then(|secs| ASN1Time::from_timestamp(secs).ok())
            .ok_or(rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
        let validity = cert.validity();
        if now < validity.not_before {
            return Err(rustls::Error::InvalidCertificate(CertificateError::NotValidYet));
        }
        if now > validity.not_after {
            return Err(rustls::Error::InvalidCertificate(CertificateError::Expired));
        }

        if cert.public_key().raw == self.idp_spki.as_slice() {
            return Ok(());
        }

        let (_, idp) = SubjectPublicKeyInfo::from_der(&self.idp_spki)
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;

        cert.verify_signature(Some(&idp))
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadSignature))
    }
}

impl ServerCertVerifier for IdpCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.verify_end_entity(end_entity.as_ref(), now)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
pub struct SkipVerification {
    algorithms: WebPkiSupportedAlgorithms,
}

impl SkipVerification {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            algorithms: supported_algorithms(),
        })
    }
}

impl ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// How relayed TLS destinations are verified
#[derive(Debug, Clone, Default)]
pub struct LocalTlsConfig {
    /// PEM public key (or certificate) of the identity provider
    pub idp_public_key: Option<String>,
    /// Extra CA bundle trusted alongside the web roots
    pub ca_file: Option<PathBuf>,
}

impl LocalTlsConfig {
    /// Use the service account CA when no bundle was configured and it exists
    pub fn with_default_ca(mut self) -> Self {
        if self.ca_file.is_none() && Path::new(SERVICE_ACCOUNT_CA).is_file() {
            self.ca_file = Some(PathBuf::from(SERVICE_ACCOUNT_CA));
        }
        self
    }

    /// Build the client config used for TLS destinations
    pub fn build(&self) -> TransportResult<Arc<rustls::ClientConfig>> {
        ensure_crypto_provider();

        let config = match &self.idp_public_key {
            Some(pem) => {
                info!("Verifying TLS destinations against the IdP public key");
                rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(IdpCertVerifier::from_pem(pem)?)
                    .with_no_client_auth()
            }
            None => {
                let extra = match &self.ca_file {
                    Some(path) => {
                        info!(ca_file = %path.display(), "Trusting extra CA bundle for TLS destinations");
                        load_certs(path)?
                    }
                    None => Vec::new(),
                };
                rustls::ClientConfig::builder()
                    .with_root_certificates(root_store(&extra)?)
                    .with_no_client_auth()
            }
        };

        Ok(Arc::new(config))
    }
}
