//! Short-lived exclusive lease on a cache key.
//!
//! Backs the per-identity refresh lock and the per-idempotency-key execution
//! claim. A lease is held until [`Lease::release`] or until its TTL lapses;
//! dropping an unreleased lease (e.g. a cancelled future) schedules the
//! release on the current runtime.

use super::{DistributedCache, KvError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct Lease {
    kv: Arc<dyn DistributedCache>,
    key: String,
    token: Vec<u8>,
    released: bool,
}

impl Lease {
    /// Tries to take the lease. `Ok(None)` means another holder has it.
    pub async fn acquire(
        kv: Arc<dyn DistributedCache>,
        key: String,
        ttl: Duration,
    ) -> Result<Option<Self>, KvError> {
        let token = Uuid::new_v4().to_string().into_bytes();
        if !kv.set_if_absent(&key, token.clone(), ttl).await? {
            return Ok(None);
        }
        debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Lease acquired");
        Ok(Some(Self {
            kv,
            key,
            token,
            released: false,
        }))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases the lease if this holder still owns it.
    pub async fn release(mut self) {
        self.released = true;
        match self.kv.compare_and_delete(&self.key, &self.token).await {
            Ok(true) => debug!(key = %self.key, "Lease released"),
            Ok(false) => warn!(key = %self.key, "Lease expired before release"),
            Err(e) => warn!(key = %self.key, error = %e, "Failed to release lease; it will lapse at TTL"),
        }
    }

    /// Restarts the lease with a fresh `ttl`. `Ok(false)` means the lease
    /// lapsed and another holder took the key; this holder no longer owns it.
    ///
    /// A lapsed lease nobody else took is re-acquired, so callers must
    /// re-check whatever the lease guards after a successful renew.
    pub async fn renew(&mut self, ttl: Duration) -> Result<bool, KvError> {
        if !self.kv.compare_and_delete(&self.key, &self.token).await? {
            debug!(key = %self.key, "Lease lapsed before renewal");
        }
        if self.kv.set_if_absent(&self.key, self.token.clone(), ttl).await? {
            debug!(key = %self.key, ttl_ms = ttl.as_millis() as u64, "Lease renewed");
            return Ok(true);
        }
        warn!(key = %self.key, "Lease taken by another holder before renewal");
        self.released = true;
        Ok(false)
    }

    /// Gives up the lease without deleting it; it lapses at its TTL.
    pub fn abandon(mut self) {
        self.released = true;
        debug!(key = %self.key, "Lease abandoned");
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let kv = Arc::clone(&self.kv);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = kv.compare_and_delete(&key, &token).await {
                warn!(key = %key, error = %e, "Failed to release dropped lease");
            }
        });
    }
}
