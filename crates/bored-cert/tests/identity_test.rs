//! Key pair lifecycle across callers and replicas

use async_trait::async_trait;
use bored_cert::{IdentityError, KeyPair, KeyPairManager, MemorySecretStore, SecretStore, StoreError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Memory store that counts writes and delays reads to widen race windows
#[derive(Default)]
struct SlowCountingStore {
    inner: MemorySecretStore,
    puts: AtomicUsize,
}

#[async_trait]
impl SecretStore for SlowCountingStore {
    async fn get(&self, namespace: &str) -> Result<Option<KeyPair>, StoreError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.inner.get(namespace).await
    }

    async fn put(&self, namespace: &str, keys: &KeyPair) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(namespace, keys).await
    }
}

#[tokio::test]
async fn test_ensure_keys_twice_returns_identical_pair() {
    let manager = KeyPairManager::new(Arc::new(MemorySecretStore::new()));

    let first = manager.ensure_keys("team-a").await.unwrap();
    let second = manager.ensure_keys("team-a").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.namespace(), "team-a");
}

#[tokio::test]
async fn test_concurrent_callers_share_one_pair() {
    let store = Arc::new(SlowCountingStore::default());
    let manager = Arc::new(KeyPairManager::new(store.clone()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move { manager.ensure_keys("team-a").await }));
    }

    let mut pairs = Vec::new();
    for handle in handles {
        pairs.push(handle.await.unwrap().unwrap());
    }

    assert!(pairs.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(store.puts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_replicas_converge_on_stored_pair() {
    // Two managers stand in for two agent replicas sharing one cluster store
    let store = Arc::new(SlowCountingStore::default());
    let replica_a = KeyPairManager::new(store.clone());
    let replica_b = KeyPairManager::new(store.clone());

    let (a, b) = tokio::join!(
        replica_a.ensure_keys("team-b"),
        replica_b.ensure_keys("team-b")
    );

    assert_eq!(a.unwrap(), b.unwrap());
}

#[tokio::test]
async fn test_namespaces_are_independent() {
    let manager = KeyPairManager::new(Arc::new(MemorySecretStore::new()));

    let a = manager.ensure_keys("team-a").await.unwrap();
    let b = manager.ensure_keys("team-b").await.unwrap();

    assert_ne!(a.private_key_pem(), b.private_key_pem());
    assert_eq!(b.namespace(), "team-b");
}

#[tokio::test]
async fn test_broken_override_dir_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(bored_cert::CERT_FILE), b"garbage").unwrap();
    std::fs::write(dir.path().join(bored_cert::KEY_FILE), b"garbage").unwrap();

    let manager =
        KeyPairManager::new(Arc::new(MemorySecretStore::new())).with_keys_dir(dir.path());
    let result = manager.ensure_keys("team-a").await;

    assert!(matches!(result, Err(IdentityError::InvalidCredentials(_))));
}
