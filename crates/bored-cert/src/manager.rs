//! Identity lifecycle: load, read, or generate-and-store

use crate::{generate_keypair, CertificateSigner, IdentityError, KeyPair, SecretStore, StoreError};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Retry policy for transient secret store failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Delay before retry `n` is `delay * n`
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

/// Ensures a key pair exists for a namespace
pub struct KeyPairManager {
    store: Arc<dyn SecretStore>,
    signer: Option<CertificateSigner>,
    keys_dir: Option<PathBuf>,
    retry: RetryPolicy,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyPairManager {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            signer: None,
            keys_dir: None,
            retry: RetryPolicy::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Sign generated certificates with this CA
    pub fn with_signer(mut self, signer: CertificateSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Prefer `tls.crt`/`tls.key` from this directory over the store
    pub fn with_keys_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.keys_dir = Some(dir.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Return the key pair for `namespace`, creating and persisting one if needed
    pub async fn ensure_keys(&self, namespace: &str) -> Result<KeyPair, IdentityError> {
        if let Some(dir) = &self.keys_dir {
            if let Some(keys) = KeyPair::load_from_dir(dir, namespace).await? {
                info!(namespace, dir = %dir.display(), "Using key pair from credential directory");
                return Ok(keys);
            }
        }

        let lock = self.namespace_lock(namespace).await;
        let _guard = lock.lock().await;

        if let Some(keys) = self.get_with_retry(namespace).await? {
            debug!(namespace, issued_at = %keys.issued_at(), "Found stored key pair");
            return Ok(keys);
        }

        info!(namespace, "No key pair stored, generating a new one");
        let keys = generate_keypair(namespace, self.signer.as_ref())?;

        match self.put_with_retry(namespace, &keys).await {
            Ok(()) => {
                info!(namespace, issued_at = %keys.issued_at(), "Stored new key pair");
                Ok(keys)
            }
            Err(StoreError::Conflict(_)) => {
                info!(namespace, "Key pair was stored concurrently, using stored pair");
                self.get_with_retry(namespace).await?.ok_or_else(|| {
                    IdentityError::StoreUnavailable(format!(
                        "key pair for {} vanished after a conflicting write",
                        namespace
                    ))
                })
            }
            Err(e) => Err(identity_error(e)),
        }
    }

    async fn namespace_lock(&self, namespace: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn get_with_retry(&self, namespace: &str) -> Result<Option<KeyPair>, IdentityError> {
        let keys = self
            .retrying(namespace, "get", || self.store.get(namespace))
            .await
            .map_err(identity_error)?;

        match keys {
            Some(keys) => {
                keys.validate()?;
                Ok(Some(keys))
            }
            None => Ok(None),
        }
    }

    async fn put_with_retry(&self, namespace: &str, keys: &KeyPair) -> Result<(), StoreError> {
        self.retrying(namespace, "put", || self.store.put(namespace, keys))
            .await
    }

    /// Run `op`, retrying `StoreError::Unavailable` with a linear delay
    async fn retrying<T, F, Fut>(&self, namespace: &str, what: &str, op: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(StoreError::Unavailable(reason)) if attempt < attempts => {
                    let delay = self.retry.delay * attempt;
                    warn!(
                        namespace,
                        attempt,
                        error = %reason,
                        "Secret store {} failed, retrying in {:?}",
                        what,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn identity_error(e: StoreError) -> IdentityError {
    match e {
        StoreError::Unavailable(reason) => IdentityError::StoreUnavailable(reason),
        StoreError::Conflict(namespace) => IdentityError::StoreUnavailable(format!(
            "unexpected conflict for namespace {}",
            namespace
        )),
        StoreError::Corrupt(reason) => IdentityError::InvalidCredentials(reason),
    }
}
