//! Preview and idempotency records in the distributed cache.
//!
//! Keys:
//! - `preview:<id>` - [`PreviewRecord`], lives for the preview TTL
//! - `idem:<key>` - [`IdempotencyRecord`], lives for the idempotency TTL
//! - `idem-claim:<key>` - short [`Lease`] held while the first execute runs

use super::ExecuteResponse;
use crate::credentials::Actor;
use crate::error::GateError;
use crate::kv::{key_part, DistributedCache, Lease};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Validated action awaiting confirmation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreviewRecord {
    pub preview_id: String,
    pub action_id: String,
    pub provider: String,
    pub actor: Actor,
    pub params: serde_json::Value,
    pub digest: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of the first execution under an idempotency key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub preview_id: String,
    pub digest: String,
    pub response: ExecuteResponse,
    pub completed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RecordStore {
    kv: Arc<dyn DistributedCache>,
    preview_ttl: Duration,
    idempotency_ttl: Duration,
}

impl RecordStore {
    pub fn new(kv: Arc<dyn DistributedCache>, preview_ttl: Duration, idempotency_ttl: Duration) -> Self {
        Self {
            kv,
            preview_ttl,
            idempotency_ttl,
        }
    }

    pub async fn put_preview(&self, record: &PreviewRecord) -> Result<(), GateError> {
        let bytes = serde_json::to_vec(record).map_err(anyhow::Error::new)?;
        self.kv
            .set(&preview_key(&record.preview_id), bytes, self.preview_ttl)
            .await?;
        Ok(())
    }

    pub async fn get_preview(&self, preview_id: &str) -> Result<Option<PreviewRecord>, GateError> {
        self.read(&preview_key(preview_id)).await
    }

    pub async fn put_idempotency(&self, record: &IdempotencyRecord) -> Result<(), GateError> {
        let bytes = serde_json::to_vec(record).map_err(anyhow::Error::new)?;
        self.kv
            .set(&idempotency_key(&record.key), bytes, self.idempotency_ttl)
            .await?;
        Ok(())
    }

    pub async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyRecord>, GateError> {
        self.read(&idempotency_key(key)).await
    }

    /// Takes the execution claim for an idempotency key. `Ok(None)` means
    /// another execute holds it.
    pub async fn claim(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, GateError> {
        Ok(Lease::acquire(Arc::clone(&self.kv), claim_key(key), ttl).await?)
    }

    pub async fn claim_active(&self, key: &str) -> Result<bool, GateError> {
        Ok(self.kv.get(&claim_key(key)).await?.is_some())
    }

    async fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, GateError> {
        let Some(bytes) = self.kv.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // Unreadable records are treated as absent
                warn!(key = %key, error = %e, "Discarding undecodable gateway record");
                Ok(None)
            }
        }
    }
}

fn preview_key(preview_id: &str) -> String {
    format!("preview:{}", key_part(preview_id))
}

fn idempotency_key(key: &str) -> String {
    format!("idem:{}", key_part(key))
}

fn claim_key(key: &str) -> String {
    format!("idem-claim:{}", key_part(key))
}
