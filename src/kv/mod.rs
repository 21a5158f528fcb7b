//! Distributed key-value cache used for the credential cache, refresh locks,
//! rate-limit counters and preview/idempotency records.
//!
//! All coordination between worker processes goes through single-key atomic
//! operations on this trait; nothing here needs multi-key transactions.
//!
//! Backends:
//! - [`MemoryKv`] - process-local, used for single-node deployments and tests
//! - [`NatsKv`] - NATS JetStream key-value bucket shared by every worker

mod lease;
mod memory;
mod nats;

pub use lease::Lease;
pub use memory::MemoryKv;
pub use nats::{NatsKv, NatsKvConfig};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("too many concurrent updates on key {0}")]
    Contention(String),

    #[error("cached value for {0} is corrupt")]
    Corrupt(String),
}

/// Atomic single-key operations with per-key TTL.
///
/// Expired entries behave exactly like absent ones for every operation.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Round-trip to the backend; used to decide whether it is reachable.
    async fn ping(&self) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Unconditional write.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError>;

    /// Writes only when no live entry exists. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration)
        -> Result<bool, KvError>;

    /// Increments a decimal counter and returns the new value. `ttl` applies
    /// only when the increment creates the key.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, KvError>;

    /// Atomic get-and-delete.
    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Deletes the key only if its live value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Remaining time to live of a live entry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError>;
}

/// Encodes an arbitrary identifier into the `[A-Za-z0-9_-]` alphabet accepted
/// by every backend.
pub fn key_part(raw: &str) -> String {
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Backend that fails every call, for exercising degraded paths.
#[cfg(test)]
pub(crate) struct UnreachableKv;

#[cfg(test)]
#[async_trait]
impl DistributedCache for UnreachableKv {
    async fn ping(&self) -> Result<(), KvError> {
        Err(KvError::Unavailable("connection refused".into()))
    }
    async fn get(&self, _: &str) -> Result<Option<Vec<u8>>, KvError> {
        Err(KvError::Unavailable("connection refused".into()))
    }
    async fn set(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<(), KvError> {
        Err(KvError::Unavailable("connection refused".into()))
    }
    async fn set_if_absent(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<bool, KvError> {
        Err(KvError::Unavailable("connection refused".into()))
    }
    async fn incr(&self, _: &str, _: Duration) -> Result<u64, KvError> {
        Err(KvError::Unavailable("connection refused".into()))
    }
    async fn take(&self, _: &str) -> Result<Option<Vec<u8>>, KvError> {
        Err(KvError::Unavailable("connection refused".into()))
    }
    async fn compare_and_delete(&self, _: &str, _: &[u8]) -> Result<bool, KvError> {
        Err(KvError::Unavailable("connection refused".into()))
    }
    async fn delete(&self, _: &str) -> Result<(), KvError> {
        Err(KvError::Unavailable("connection refused".into()))
    }
    async fn ttl(&self, _: &str) -> Result<Option<Duration>, KvError> {
        Err(KvError::Unavailable("connection refused".into()))
    }
}
