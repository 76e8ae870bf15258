//! Agent identity management
//!
//! Ensures the agent owns a TLS client identity for its namespace: loaded from
//! a local directory override, read from the cluster secret store, or
//! generated on first run and persisted with create-only semantics so that
//! concurrent replicas converge on a single key pair.

pub mod generate;
pub mod keypair;
pub mod manager;
pub mod store;

pub use generate::{generate_keypair, CertificateSigner};
pub use keypair::KeyPair;
pub use manager::{KeyPairManager, RetryPolicy};
pub use store::{KubeSecretStore, MemorySecretStore, SecretStore};

use thiserror::Error;

/// Name of the certificate file in secrets and credential directories
pub const CERT_FILE: &str = "tls.crt";

/// Name of the private key file in secrets and credential directories
pub const KEY_FILE: &str = "tls.key";

/// Identity errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Secret store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Key generation failed: {0}")]
    Generation(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),
}

/// Secret store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Secret store unavailable: {0}")]
    Unavailable(String),

    #[error("Credentials already stored for namespace {0}")]
    Conflict(String),

    #[error("Stored credentials are corrupt: {0}")]
    Corrupt(String),
}
