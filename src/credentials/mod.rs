//! Encrypted credential storage for provider tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - store / get / delete / list           │
//! │  - durable write first, cache best-effort│
//! └─────────────────────────────────────────┘
//!      ↓ (seal)       ↑ (open)         ↕
//! ┌──────────────────────┐  ┌──────────────────────┐
//! │  Codec (AES-256-GCM) │  │  CredentialCache      │
//! └──────────────────────┘  │  TTL = time to expiry │
//!      ↓              ↑     └──────────────────────┘
//! ┌─────────────────────────────────────────┐
//! │       DurableStore (SQLite)              │
//! │  - ciphertext only, source of truth      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Security
//!
//! - Tokens are encrypted at rest; each encryption uses a fresh nonce
//! - The cache holds decrypted copies that never outlive the token
//! - `Credential`'s `Debug` output redacts both tokens

use crate::error::GateError;
use crate::kv::key_part;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};

mod cache;
mod encryption;
mod storage;

pub use cache::CredentialCache;
pub use encryption::{Codec, CodecError};
pub use storage::{DurableStore, SealedCredential};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    User,
    Service,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Service => "service",
        }
    }
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ActorType::User),
            "service" => Ok(ActorType::Service),
            other => Err(format!("unknown actor type '{}'", other)),
        }
    }
}

/// The tenant actor an action runs on behalf of.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub workspace_id: String,
    pub actor_type: ActorType,
    pub actor_id: String,
}

impl Actor {
    pub fn new(
        workspace_id: impl Into<String>,
        actor_type: ActorType,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            actor_type,
            actor_id: actor_id.into(),
        }
    }

    pub fn identity_for(&self, provider: &str) -> Identity {
        Identity::new(
            provider,
            self.workspace_id.clone(),
            self.actor_type,
            self.actor_id.clone(),
        )
    }
}

/// Names exactly one credential.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub provider: String,
    pub workspace_id: String,
    pub actor_type: ActorType,
    pub actor_id: String,
}

impl Identity {
    pub fn new(
        provider: impl Into<String>,
        workspace_id: impl Into<String>,
        actor_type: ActorType,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            workspace_id: workspace_id.into(),
            actor_type,
            actor_id: actor_id.into(),
        }
    }

    /// Fast-cache key for this credential.
    pub fn cache_key(&self) -> String {
        format!(
            "cred:{}:{}:{}:{}",
            key_part(&self.provider),
            key_part(&self.workspace_id),
            self.actor_type,
            key_part(&self.actor_id)
        )
    }

    /// Refresh-lock key. Scoped by workspace, actor type and provider, plus
    /// the actor id so distinct actors never wait on each other.
    pub fn lock_key(&self) -> String {
        format!(
            "refresh-lock:{}:{}:{}:{}",
            key_part(&self.workspace_id),
            self.actor_type,
            key_part(&self.provider),
            key_part(&self.actor_id)
        )
    }

    pub fn actor(&self) -> Actor {
        Actor::new(self.workspace_id.clone(), self.actor_type, self.actor_id.clone())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.provider, self.workspace_id, self.actor_type, self.actor_id
        )
    }
}

/// Observable lifecycle position of a credential.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialState {
    Valid,
    NearExpiry,
    Refreshing,
    Expired,
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CredentialState::Valid => "valid",
            CredentialState::NearExpiry => "near_expiry",
            CredentialState::Refreshing => "refreshing",
            CredentialState::Expired => "expired",
        })
    }
}

/// A decrypted provider grant for one identity.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub identity: Identity,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scope: BTreeSet<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

impl Credential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }

    /// Whether the token stays usable for at least `margin` from `now`.
    pub fn is_valid_beyond(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at > now + margin
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_token.is_some()
    }

    pub fn state(&self, margin: Duration, now: DateTime<Utc>) -> CredentialState {
        if self.is_valid_beyond(margin, now) {
            CredentialState::Valid
        } else if self.is_expired_at(now) {
            CredentialState::Expired
        } else {
            CredentialState::NearExpiry
        }
    }

    fn seal(&self, codec: &Codec) -> Result<SealedCredential, CodecError> {
        Ok(SealedCredential {
            identity: self.identity.clone(),
            access_token: codec.encrypt(&self.access_token)?,
            refresh_token: self
                .refresh_token
                .as_deref()
                .map(|token| codec.encrypt(token))
                .transpose()?,
            expires_at: self.expires_at,
            scope: self.scope.clone(),
        })
    }

    fn open(sealed: SealedCredential, codec: &Codec) -> Result<Self, CodecError> {
        Ok(Self {
            access_token: codec.decrypt(&sealed.access_token)?,
            refresh_token: sealed
                .refresh_token
                .as_deref()
                .map(|token| codec.decrypt(token))
                .transpose()?,
            identity: sealed.identity,
            expires_at: sealed.expires_at,
            scope: sealed.scope,
        })
    }
}

/// Write-through credential store: durable SQLite table plus an optional
/// fast cache.
///
/// The durable store is authoritative. The cache may be flushed at any time;
/// reads then fall through to SQLite and warm it again.
pub struct CredentialStore {
    durable: DurableStore,
    cache: Option<CredentialCache>,
    codec: Codec,
}

impl CredentialStore {
    pub fn new(durable: DurableStore, codec: Codec, cache: Option<CredentialCache>) -> Self {
        Self {
            durable,
            cache,
            codec,
        }
    }

    /// Upserts durably, then mirrors into the cache. Only the durable write
    /// can fail the call.
    pub async fn store(&self, credential: &Credential) -> Result<(), GateError> {
        let sealed = credential.seal(&self.codec)?;
        self.durable.upsert(&sealed)?;

        info!(
            provider = %credential.identity.provider,
            workspace_id = %credential.identity.workspace_id,
            actor_type = %credential.identity.actor_type,
            actor_id = %credential.identity.actor_id,
            expires_at = %credential.expires_at,
            refreshable = credential.is_refreshable(),
            "Stored credential"
        );

        if let Some(cache) = &self.cache {
            cache.put(credential).await;
        }
        Ok(())
    }

    /// Cache first, then the durable store.
    ///
    /// Returns `None` when nothing is stored, or when the stored token has
    /// expired and cannot be refreshed.
    pub async fn get(&self, identity: &Identity) -> Result<Option<Credential>, GateError> {
        if let Some(cache) = &self.cache {
            if let Some(credential) = cache.get(identity).await {
                return Ok(Some(credential));
            }
        }
        self.reload(identity).await
    }

    /// Reads the durable store, bypassing the cache, and rewarms the cache.
    ///
    /// Used when a cached entry may be stale, e.g. a refresh written while
    /// the cache was unreachable.
    pub async fn reload(&self, identity: &Identity) -> Result<Option<Credential>, GateError> {
        let Some(sealed) = self.durable.fetch(identity)? else {
            return Ok(None);
        };
        let credential = Credential::open(sealed, &self.codec)?;

        let now = Utc::now();
        if credential.is_expired_at(now) {
            if !credential.is_refreshable() {
                debug!(identity = %identity, "Stored credential expired and is not refreshable");
                return Ok(None);
            }
            return Ok(Some(credential));
        }

        if let Some(cache) = &self.cache {
            cache.put(&credential).await;
        }
        Ok(Some(credential))
    }

    /// Removes the credential from both stores. Returns whether a durable
    /// row existed.
    pub async fn delete(&self, identity: &Identity) -> Result<bool, GateError> {
        let existed = self.durable.remove(identity)?;
        if let Some(cache) = &self.cache {
            cache.evict(identity).await;
        }
        info!(identity = %identity, existed, "Deleted credential");
        Ok(existed)
    }

    pub fn list_for_workspace(&self, workspace_id: &str) -> Result<Vec<Identity>, GateError> {
        Ok(self.durable.list_by_workspace(workspace_id)?)
    }

    pub fn list_all(&self) -> Result<Vec<(Identity, DateTime<Utc>)>, GateError> {
        Ok(self.durable.list_all()?)
    }

    /// Whether the fast cache is currently failing.
    pub fn cache_degraded(&self) -> bool {
        self.cache
            .as_ref()
            .map(|cache| cache.degraded().is_degraded())
            .unwrap_or(false)
    }

    pub fn cache(&self) -> Option<&CredentialCache> {
        self.cache.as_ref()
    }
}

#[cfg(test)]
mod tests;
