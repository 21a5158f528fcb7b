//! NATS JetStream key-value backend.
//!
//! JetStream buckets only expire whole histories by `max_age`, so per-key TTL
//! is carried inside the value: every stored payload is an 8-byte big-endian
//! expiry (unix millis) followed by the raw value. Expired payloads read as
//! absent. Conditional operations use revision-checked `create`/`update`, and
//! conditional deletes overwrite the key with an already-expired tombstone
//! under a revision check.

use super::{DistributedCache, KvError};
use anyhow::{Context, Result};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

/// Upper bound on compare-and-set retries for one logical operation.
const MAX_CAS_ATTEMPTS: usize = 16;

/// NATS key-value configuration
#[derive(Clone, Debug, Deserialize)]
pub struct NatsKvConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Physical retention of any key, regardless of its logical TTL.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_url() -> String {
    std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

fn default_bucket() -> String {
    "CREDGATE".to_string()
}

fn default_max_age_secs() -> u64 {
    86_400
}

impl Default for NatsKvConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            bucket: default_bucket(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

/// [`DistributedCache`] backed by a JetStream key-value bucket.
pub struct NatsKv {
    store: kv::Store,
}

impl NatsKv {
    /// Connect to NATS and open (or create) the bucket.
    pub async fn connect(config: &NatsKvConfig) -> Result<Self> {
        info!(url = %config.url, bucket = %config.bucket, "Connecting to NATS key-value bucket");

        let client = async_nats::connect(&config.url)
            .await
            .context("Failed to connect to NATS")?;
        let jetstream = jetstream::new(client);

        let store = match jetstream.get_key_value(config.bucket.clone()).await {
            Ok(store) => {
                info!("Bucket '{}' already exists", config.bucket);
                store
            }
            Err(_) => {
                info!("Bucket '{}' does not exist, creating...", config.bucket);
                jetstream
                    .create_key_value(kv::Config {
                        bucket: config.bucket.clone(),
                        history: 1,
                        max_age: Duration::from_secs(config.max_age_secs),
                        ..Default::default()
                    })
                    .await
                    .context("Failed to create key-value bucket")?
            }
        };

        Ok(Self { store })
    }

    /// Latest revision of `key` and, when still live, its expiry and value.
    async fn current(&self, key: &str) -> Result<Option<(u64, Option<Payload>)>, KvError> {
        let entry = self
            .store
            .entry(nats_key(key))
            .await
            .map_err(unavailable)?;

        Ok(entry.map(|entry| {
            let live = match entry.operation {
                kv::Operation::Put => Payload::decode(&entry.value).filter(Payload::is_live),
                _ => None,
            };
            (entry.revision, live)
        }))
    }

    /// Writes `payload` only if `key` is still at `revision` (or absent when
    /// `revision` is `None`).
    async fn write_at(&self, key: &str, revision: Option<u64>, payload: Vec<u8>) -> bool {
        match revision {
            Some(revision) => self
                .store
                .update(nats_key(key), payload.into(), revision)
                .await
                .is_ok(),
            None => self.store.create(nats_key(key), payload.into()).await.is_ok(),
        }
    }
}

#[async_trait]
impl DistributedCache for NatsKv {
    async fn ping(&self) -> Result<(), KvError> {
        self.store.get("_ping").await.map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self
            .current(key)
            .await?
            .and_then(|(_, live)| live)
            .map(|payload| payload.value))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        self.store
            .put(nats_key(key), Payload::encode(&value, ttl).into())
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let revision = match self.current(key).await? {
            Some((_, Some(_))) => return Ok(false),
            Some((revision, None)) => Some(revision),
            None => None,
        };

        if self.write_at(key, revision, Payload::encode(&value, ttl)).await {
            return Ok(true);
        }

        // Lost a race, or the backend failed; tell the two apart.
        match self.current(key).await? {
            Some((_, Some(_))) => Ok(false),
            _ => Err(KvError::Unavailable(format!("conditional write on {} failed", key))),
        }
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, KvError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (revision, next, expires_at_ms) = match self.current(key).await? {
                Some((revision, Some(payload))) => {
                    let count: u64 = std::str::from_utf8(&payload.value)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| KvError::Corrupt(key.to_string()))?;
                    (Some(revision), count + 1, payload.expires_at_ms)
                }
                Some((revision, None)) => (Some(revision), 1, expiry_from_now(ttl)),
                None => (None, 1, expiry_from_now(ttl)),
            };

            let payload = Payload {
                expires_at_ms,
                value: next.to_string().into_bytes(),
            };
            if self.write_at(key, revision, payload.to_bytes()).await {
                return Ok(next);
            }
        }
        Err(KvError::Contention(key.to_string()))
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (revision, payload) = match self.current(key).await? {
                Some((revision, Some(payload))) => (revision, payload),
                _ => return Ok(None),
            };
            if self.write_at(key, Some(revision), Payload::tombstone()).await {
                return Ok(Some(payload.value));
            }
        }
        Err(KvError::Contention(key.to_string()))
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, KvError> {
        match self.current(key).await? {
            Some((revision, Some(payload))) if payload.value == expected => {
                Ok(self.write_at(key, Some(revision), Payload::tombstone()).await)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.store.delete(nats_key(key)).await.map_err(unavailable)?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        Ok(self
            .current(key)
            .await?
            .and_then(|(_, live)| live)
            .map(|payload| payload.remaining()))
    }
}

/// Stored value with its logical expiry.
#[derive(Debug, PartialEq)]
struct Payload {
    expires_at_ms: i64,
    value: Vec<u8>,
}

impl Payload {
    fn encode(value: &[u8], ttl: Duration) -> Vec<u8> {
        Payload {
            expires_at_ms: expiry_from_now(ttl),
            value: value.to_vec(),
        }
        .to_bytes()
    }

    fn tombstone() -> Vec<u8> {
        Payload {
            expires_at_ms: 0,
            value: Vec::new(),
        }
        .to_bytes()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + self.value.len());
        bytes.extend_from_slice(&self.expires_at_ms.to_be_bytes());
        bytes.extend_from_slice(&self.value);
        bytes
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 8 {
            return None;
        }
        let (expiry, value) = bytes.split_at(8);
        let expires_at_ms = i64::from_be_bytes(expiry.try_into().ok()?);
        Some(Self {
            expires_at_ms,
            value: value.to_vec(),
        })
    }

    fn is_live(&self) -> bool {
        self.expires_at_ms > Utc::now().timestamp_millis()
    }

    fn remaining(&self) -> Duration {
        let left = self.expires_at_ms - Utc::now().timestamp_millis();
        Duration::from_millis(left.max(0) as u64)
    }
}

fn expiry_from_now(ttl: Duration) -> i64 {
    Utc::now().timestamp_millis() + ttl.as_millis() as i64
}

/// JetStream keys allow `[-/_=.a-zA-Z0-9]`; our `:` separators become `.`.
fn nats_key(key: &str) -> String {
    key.replace(':', ".")
}

fn unavailable(e: impl std::fmt::Display) -> KvError {
    KvError::Unavailable(e.to_string())
}
