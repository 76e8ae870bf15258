//! Persistent storage for agent key pairs

use crate::{KeyPair, StoreError, CERT_FILE, KEY_FILE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Default name of the Secret holding the agent key pair
pub const DEFAULT_SECRET_NAME: &str = "bored-agent-cert";

/// Annotation recording when the key pair was issued (RFC 3339)
pub const ISSUED_AT_ANNOTATION: &str = "bored.dev/issued-at";

/// Storage backend for key pairs, keyed by namespace
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the key pair for `namespace`, `Ok(None)` if none is stored
    async fn get(&self, namespace: &str) -> Result<Option<KeyPair>, StoreError>;

    /// Store a key pair; fails with [`StoreError::Conflict`] if one already exists
    async fn put(&self, namespace: &str, keys: &KeyPair) -> Result<(), StoreError>;
}

/// In-memory store
#[derive(Clone, Default)]
pub struct MemorySecretStore {
    entries: Arc<RwLock<HashMap<String, KeyPair>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, namespace: &str) -> Result<Option<KeyPair>, StoreError> {
        trace!(namespace, "Reading key pair from memory store");
        Ok(self.entries.read().await.get(namespace).cloned())
    }

    async fn put(&self, namespace: &str, keys: &KeyPair) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(namespace) {
            return Err(StoreError::Conflict(namespace.to_string()));
        }
        debug!(namespace, "Storing key pair in memory store");
        entries.insert(namespace.to_string(), keys.clone());
        Ok(())
    }
}

/// Store backed by a Kubernetes `kubernetes.io/tls` Secret in the agent's namespace
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
    secret_name: String,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            secret_name: DEFAULT_SECRET_NAME.to_string(),
        }
    }

    /// Connect using the in-cluster service account or the local kubeconfig
    pub async fn try_default() -> Result<Self, StoreError> {
        let client = Client::try_default()
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to create kube client: {}", e)))?;
        Ok(Self::new(client))
    }

    pub fn with_secret_name(mut self, name: impl Into<String>) -> Self {
        self.secret_name = name.into();
        self
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str) -> Result<Option<KeyPair>, StoreError> {
        let secret = match self.api(namespace).get(&self.secret_name).await {
            Ok(s) => s,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(namespace, secret = %self.secret_name, "Key pair secret not found");
                return Ok(None);
            }
            Err(e) => return Err(StoreError::Unavailable(e.to_string())),
        };

        keypair_from_secret(namespace, &secret).map(Some)
    }

    async fn put(&self, namespace: &str, keys: &KeyPair) -> Result<(), StoreError> {
        let secret = secret_from_keypair(&self.secret_name, namespace, keys);

        match self
            .api(namespace)
            .create(&PostParams::default(), &secret)
            .await
        {
            Ok(_) => {
                debug!(namespace, secret = %self.secret_name, "Key pair persisted to Secret");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(StoreError::Conflict(namespace.to_string()))
            }
            Err(e) => Err(StoreError::Unavailable(e.to_string())),
        }
    }
}

fn secret_from_keypair(name: &str, namespace: &str, keys: &KeyPair) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                "bored-agent".to_string(),
            )])),
            annotations: Some(BTreeMap::from([(
                ISSUED_AT_ANNOTATION.to_string(),
                keys.issued_at().to_rfc3339(),
            )])),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(BTreeMap::from([
            (
                CERT_FILE.to_string(),
                ByteString(keys.certificate_pem().to_vec()),
            ),
            (
                KEY_FILE.to_string(),
                ByteString(keys.private_key_pem().to_vec()),
            ),
        ])),
        ..Default::default()
    }
}

fn keypair_from_secret(namespace: &str, secret: &Secret) -> Result<KeyPair, StoreError> {
    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| StoreError::Corrupt("secret has no data".to_string()))?;

    let field = |key: &str| {
        data.get(key)
            .map(|v| v.0.clone())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| StoreError::Corrupt(format!("secret is missing {}", key)))
    };
    let certificate = field(CERT_FILE)?;
    let private_key = field(KEY_FILE)?;

    let issued_at = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ISSUED_AT_ANNOTATION))
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc));

    match issued_at {
        Some(issued_at) => Ok(KeyPair::new(private_key, certificate, namespace, issued_at)),
        // secrets created by hand carry no annotation
        None => KeyPair::from_pem(private_key, certificate, namespace)
            .map_err(|e| StoreError::Corrupt(e.to_string())),
    }
}
