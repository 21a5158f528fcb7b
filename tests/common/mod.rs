// Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use credgate::credentials::{
    ActorType, Codec, Credential, CredentialCache, CredentialStore, DurableStore, Identity,
};
use credgate::kv::{DistributedCache, KvError, MemoryKv};
use credgate::metrics::MetricsSink;
use credgate::oauth::TokenGrant;
use credgate::refresh::{RefreshError, TokenRefresher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Cache backend with an outage switch ───────────────────────────────────────

#[derive(Default)]
pub struct FlakyKv {
    inner: MemoryKv,
    down: AtomicBool,
}

impl FlakyKv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), KvError> {
        if self.down.load(Ordering::SeqCst) {
            Err(KvError::Unavailable("injected outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DistributedCache for FlakyKv {
    async fn ping(&self) -> Result<(), KvError> {
        self.check()?;
        self.inner.ping().await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool, KvError> {
        self.check()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, KvError> {
        self.check()?;
        self.inner.incr(key, ttl).await
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.check()?;
        self.inner.take(key).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, KvError> {
        self.check()?;
        self.inner.compare_and_delete(key, expected).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        self.check()?;
        self.inner.ttl(key).await
    }
}

// ── Provider refresh double ───────────────────────────────────────────────────

pub struct CountingRefresher {
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingRefresher {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
    async fn refresh(&self, _credential: &Credential) -> Result<TokenGrant, RefreshError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        Ok(TokenGrant {
            access_token: format!("refreshed-{}", n),
            refresh_token: Some(format!("rotated-{}", n)),
            expires_in: Some(3600),
            scope: None,
            token_type: Some("Bearer".to_string()),
        })
    }
}

// ── Credentials ───────────────────────────────────────────────────────────────

pub fn identity() -> Identity {
    Identity::new("github", "ws1", ActorType::User, "u1")
}

pub fn credential(expires_in: chrono::Duration) -> Credential {
    Credential {
        identity: identity(),
        access_token: "original".to_string(),
        refresh_token: Some("refresh-1".to_string()),
        expires_at: Utc::now() + expires_in,
        scope: ["repo".to_string()].into(),
    }
}

/// One worker's view of the shared database and cache.
pub fn worker_store(
    db_path: &Path,
    key: &str,
    kv: Arc<dyn DistributedCache>,
    metrics: Arc<dyn MetricsSink>,
) -> Arc<CredentialStore> {
    Arc::new(CredentialStore::new(
        DurableStore::open(db_path).unwrap(),
        Codec::from_base64(key).unwrap(),
        Some(CredentialCache::new(kv, metrics)),
    ))
}
