//! Fast credential cache over the distributed key-value backend.
//!
//! Entries are the decrypted credential as JSON, stored with a TTL equal to
//! the token's remaining validity so an entry never outlives its token.
//! Backend failures are absorbed here: they flip the cache's
//! [`DegradedMode`] and callers fall through to the durable store.

use super::{Credential, Identity};
use crate::degraded::DegradedMode;
use crate::kv::DistributedCache;
use crate::metrics::{names, MetricLabels, MetricsSink};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct CredentialCache {
    kv: Arc<dyn DistributedCache>,
    degraded: DegradedMode,
    metrics: Arc<dyn MetricsSink>,
}

impl CredentialCache {
    pub fn new(kv: Arc<dyn DistributedCache>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            kv,
            degraded: DegradedMode::new("credential_cache"),
            metrics,
        }
    }

    /// Mirrors a credential. Skipped when it has no validity left.
    pub async fn put(&self, credential: &Credential) {
        let ttl = match credential.remaining(Utc::now()).to_std() {
            Ok(ttl) if !ttl.is_zero() => ttl,
            _ => {
                debug!(identity = %credential.identity, "Not caching expired credential");
                return;
            }
        };

        let payload = match serde_json::to_vec(credential) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(identity = %credential.identity, error = %e, "Failed to encode credential for cache");
                return;
            }
        };

        match self.kv.set(&credential.identity.cache_key(), payload, ttl).await {
            Ok(()) => self.degraded.clear(),
            Err(e) => {
                warn!(identity = %credential.identity, error = %e, "Credential cache write failed");
                self.degraded.enter(&e.to_string());
            }
        }
    }

    /// Cached credential, if present and not yet expired.
    pub async fn get(&self, identity: &Identity) -> Option<Credential> {
        let labels = MetricLabels::new(&identity.provider, "", "");
        let bytes = match self.kv.get(&identity.cache_key()).await {
            Ok(bytes) => {
                self.degraded.clear();
                bytes
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "Credential cache read failed");
                self.degraded.enter(&e.to_string());
                self.metrics.increment(
                    names::CREDENTIAL_CACHE,
                    &MetricLabels { reason: "error", ..labels },
                );
                return None;
            }
        };

        let credential = bytes.and_then(|bytes| match serde_json::from_slice::<Credential>(&bytes) {
            Ok(credential) => Some(credential),
            Err(e) => {
                warn!(identity = %identity, error = %e, "Discarding undecodable cache entry");
                None
            }
        });

        // Never serve an entry past its token's expiry, whatever the backend TTL says.
        let credential = credential
            .filter(|c| &c.identity == identity && !c.is_expired_at(Utc::now()));

        let reason = if credential.is_some() { "hit" } else { "miss" };
        self.metrics.increment(names::CREDENTIAL_CACHE, &MetricLabels { reason, ..labels });
        credential
    }

    pub async fn evict(&self, identity: &Identity) {
        if let Err(e) = self.kv.delete(&identity.cache_key()).await {
            warn!(identity = %identity, error = %e, "Credential cache delete failed");
            self.degraded.enter(&e.to_string());
        }
    }

    pub fn degraded(&self) -> &DegradedMode {
        &self.degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ActorType;
    use crate::kv::{MemoryKv, UnreachableKv};
    use crate::metrics::MetricsRecorder;
    use std::time::Duration;

    fn credential(expires_in: chrono::Duration) -> Credential {
        Credential {
            identity: Identity::new("github", "ws1", ActorType::User, "u1"),
            access_token: "gho_access".to_string(),
            refresh_token: Some("ghr_refresh".to_string()),
            expires_at: Utc::now() + expires_in,
            scope: Default::default(),
        }
    }

    fn cache_with(kv: Arc<dyn DistributedCache>) -> (CredentialCache, Arc<MetricsRecorder>) {
        let metrics = Arc::new(MetricsRecorder::new());
        (CredentialCache::new(kv, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_ttl_never_exceeds_remaining_validity() {
        let kv = Arc::new(MemoryKv::new());
        let (cache, _) = cache_with(kv.clone());
        let cred = credential(chrono::Duration::seconds(90));

        cache.put(&cred).await;

        let ttl = kv.ttl(&cred.identity.cache_key()).await.unwrap().unwrap();
        let remaining = cred.remaining(Utc::now()).to_std().unwrap();
        assert!(ttl <= remaining + Duration::from_millis(5));
        assert!(ttl <= Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_expired_credential_is_not_written() {
        let kv = Arc::new(MemoryKv::new());
        let (cache, _) = cache_with(kv.clone());
        let cred = credential(chrono::Duration::seconds(-5));

        cache.put(&cred).await;

        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_hit_and_miss() {
        let kv = Arc::new(MemoryKv::new());
        let (cache, metrics) = cache_with(kv);
        let cred = credential(chrono::Duration::hours(1));

        assert!(cache.get(&cred.identity).await.is_none());
        cache.put(&cred).await;
        let hit = cache.get(&cred.identity).await.expect("cache hit");

        assert_eq!(hit.access_token, cred.access_token);
        assert_eq!(metrics.count(names::CREDENTIAL_CACHE, "hit"), 1);
        assert_eq!(metrics.count(names::CREDENTIAL_CACHE, "miss"), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_is_a_miss() {
        let kv = Arc::new(MemoryKv::new());
        let (cache, _) = cache_with(kv.clone());
        let cred = credential(chrono::Duration::seconds(-1));

        // Written behind the cache's back with a TTL longer than the token's life
        kv.set(
            &cred.identity.cache_key(),
            serde_json::to_vec(&cred).unwrap(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        assert!(cache.get(&cred.identity).await.is_none());
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_instead_of_failing() {
        let (cache, metrics) = cache_with(Arc::new(UnreachableKv));
        let cred = credential(chrono::Duration::hours(1));

        cache.put(&cred).await;
        assert!(cache.degraded().is_degraded());

        assert!(cache.get(&cred.identity).await.is_none());
        assert_eq!(metrics.count(names::CREDENTIAL_CACHE, "error"), 1);
    }
}
