//! Process-local cache backend.
//!
//! Each operation runs under the DashMap shard lock for its key, which gives
//! the same single-key atomicity the distributed backend provides.

use super::{DistributedCache, KvError};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

struct Slot {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Slot {
    fn new(value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

/// In-memory [`DistributedCache`] with per-entry expiry.
///
/// Share one instance through an `Arc` to simulate several workers talking to
/// the same backend.
#[derive(Default)]
pub struct MemoryKv {
    slots: DashMap<String, Slot>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every entry. Safe at any time: the cache only mirrors state that
    /// can be rebuilt.
    pub fn flush(&self) {
        self.slots.clear();
    }

    /// Removes expired entries; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live());
        before.saturating_sub(self.slots.len())
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl DistributedCache for MemoryKv {
    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let found = self
            .slots
            .get(key)
            .map(|slot| slot.is_live().then(|| slot.value.clone()));

        match found {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                self.slots.remove_if(key, |_, slot| !slot.is_live());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), KvError> {
        self.slots.insert(key.to_string(), Slot::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    Ok(false)
                } else {
                    occupied.insert(Slot::new(value, ttl));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, KvError> {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_live() => {
                let slot = occupied.get_mut();
                let current: u64 = std::str::from_utf8(&slot.value)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| KvError::Corrupt(key.to_string()))?;
                let next = current + 1;
                slot.value = next.to_string().into_bytes();
                Ok(next)
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(Slot::new(b"1".to_vec(), ttl));
                Ok(1)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(b"1".to_vec(), ttl));
                Ok(1)
            }
        }
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self
            .slots
            .remove(key)
            .and_then(|(_, slot)| slot.is_live().then_some(slot.value)))
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, KvError> {
        Ok(self
            .slots
            .remove_if(key, |_, slot| slot.is_live() && slot.value == expected)
            .is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.slots.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let now = Instant::now();
        Ok(self
            .slots
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| slot.expires_at - now))
    }
}
