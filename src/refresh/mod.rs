//! Credential refresh coordination.
//!
//! Per identity: `VALID → NEAR_EXPIRY → REFRESHING → VALID | EXPIRED`.
//!
//! Only one worker refreshes a given identity at a time. The winner of the
//! distributed refresh lock calls the provider and writes through the
//! credential store; everyone else waits a fixed delay and re-reads the
//! durable store until the new token shows up or the wait budget runs out. If the lock backend itself
//! fails, refreshes are serialized per identity inside this process instead,
//! so a cache outage never blocks credential use.

mod oauth;

pub use oauth::OAuthRefresher;

use crate::config::RefreshConfig;
use crate::credentials::{Credential, CredentialState, CredentialStore, Identity};
use crate::error::{GateError, RefreshFailure};
use crate::kv::{DistributedCache, Lease};
use crate::metrics::{names, MetricLabels, MetricsSink};
use crate::oauth::TokenGrant;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A classified provider refresh failure. `detail` is for logs only.
#[derive(Debug, Error)]
#[error("{kind} refresh failure: {detail}")]
pub struct RefreshError {
    pub kind: RefreshFailure,
    pub detail: String,
}

impl RefreshError {
    pub fn invalid_grant(detail: impl Into<String>) -> Self {
        Self {
            kind: RefreshFailure::InvalidGrant,
            detail: detail.into(),
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            kind: RefreshFailure::Transient,
            detail: detail.into(),
        }
    }
}

/// Calls a provider's refresh endpoint.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, credential: &Credential) -> Result<TokenGrant, RefreshError>;
}

pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    /// Lock backend; `None` means a single-process deployment.
    kv: Option<Arc<dyn DistributedCache>>,
    refresher: Arc<dyn TokenRefresher>,
    config: RefreshConfig,
    local_locks: DashMap<Identity, Arc<Mutex<()>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        kv: Option<Arc<dyn DistributedCache>>,
        refresher: Arc<dyn TokenRefresher>,
        config: RefreshConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            kv,
            refresher,
            config,
            local_locks: DashMap::new(),
            metrics,
        }
    }

    /// Upper bound on one [`RefreshCoordinator::get_with_auto_refresh`].
    pub fn max_duration(&self) -> Duration {
        self.config.max_duration()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Returns a credential valid beyond the safety margin, refreshing it
    /// first if needed.
    pub async fn get_with_auto_refresh(&self, identity: &Identity) -> Result<Credential, GateError> {
        let Some(credential) = self.store.get(identity).await? else {
            self.record(identity, "missing");
            return Err(GateError::CredentialMissing {
                identity: identity.clone(),
            });
        };

        let margin = self.config.safety_margin();
        if credential.state(margin, Utc::now()) == CredentialState::Valid {
            return Ok(credential);
        }

        // The cache may lag a refresh written during a cache outage
        let Some(credential) = self.store.reload(identity).await? else {
            self.record(identity, "expired");
            return Err(GateError::CredentialExpired {
                identity: identity.clone(),
            });
        };
        let state = credential.state(margin, Utc::now());
        if state == CredentialState::Valid {
            return Ok(credential);
        }

        if !credential.is_refreshable() {
            info!(identity = %identity, state = %state, "Credential not refreshable");
            self.record(identity, "expired");
            return Err(GateError::CredentialExpired {
                identity: identity.clone(),
            });
        }

        let Some(kv) = &self.kv else {
            return self.refresh_locally(identity).await;
        };

        match Lease::acquire(Arc::clone(kv), identity.lock_key(), self.config.lock_ttl()).await {
            Ok(Some(lease)) => {
                let result = self.refresh_holding_lock(identity).await;
                lease.release().await;
                result
            }
            Ok(None) => self.wait_for_refresh(identity).await,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Refresh lock unavailable, refreshing under local lock");
                self.record(identity, "lock_unavailable");
                self.refresh_locally(identity).await
            }
        }
    }

    /// Serializes refreshes of one identity within this process.
    async fn refresh_locally(&self, identity: &Identity) -> Result<Credential, GateError> {
        let lock = self
            .local_locks
            .entry(identity.clone())
            .or_default()
            .clone();
        let _guard = lock.lock().await;
        self.refresh_holding_lock(identity).await
    }

    async fn refresh_holding_lock(&self, identity: &Identity) -> Result<Credential, GateError> {
        // Another holder may have finished between our read and the lock.
        let Some(current) = self.store.reload(identity).await? else {
            self.record(identity, "missing");
            return Err(GateError::CredentialMissing {
                identity: identity.clone(),
            });
        };
        if current.is_valid_beyond(self.config.safety_margin(), Utc::now()) {
            debug!(identity = %identity, "Credential already refreshed by another holder");
            return Ok(current);
        }
        if !current.is_refreshable() {
            self.record(identity, "expired");
            return Err(GateError::CredentialExpired {
                identity: identity.clone(),
            });
        }

        info!(identity = %identity, state = %CredentialState::Refreshing, "Refreshing credential");

        let outcome = tokio::time::timeout(
            self.config.request_timeout(),
            self.refresher.refresh(&current),
        )
        .await
        .unwrap_or_else(|_| Err(RefreshError::transient("refresh request timed out")));

        match outcome {
            Ok(grant) => {
                let refreshed = grant.into_credential(identity.clone(), Some(&current), Utc::now());
                self.store.store(&refreshed).await?;
                info!(
                    identity = %identity,
                    expires_at = %refreshed.expires_at,
                    rotated = refreshed.refresh_token != current.refresh_token,
                    "Credential refreshed"
                );
                self.record(identity, "refreshed");
                Ok(refreshed)
            }
            Err(e) => {
                let state = current.state(self.config.safety_margin(), Utc::now());
                warn!(
                    identity = %identity,
                    kind = %e.kind,
                    state = %state,
                    detail = %crate::gateway::redact_detail(&e.detail),
                    "Credential refresh failed"
                );
                self.record(
                    identity,
                    match e.kind {
                        RefreshFailure::InvalidGrant => "invalid_grant",
                        RefreshFailure::Transient => "transient",
                    },
                );
                Err(GateError::RefreshFailed {
                    identity: identity.clone(),
                    kind: e.kind,
                })
            }
        }
    }

    /// Another worker holds the lock: re-read until its result lands.
    async fn wait_for_refresh(&self, identity: &Identity) -> Result<Credential, GateError> {
        let margin = self.config.safety_margin();
        for attempt in 1..=self.config.max_wait_attempts {
            tokio::time::sleep(self.config.wait_delay()).await;

            if let Some(credential) = self.store.reload(identity).await? {
                if credential.is_valid_beyond(margin, Utc::now()) {
                    debug!(identity = %identity, attempt, "Observed credential refreshed elsewhere");
                    self.record(identity, "waited");
                    return Ok(credential);
                }
            }
        }

        info!(identity = %identity, "Refresh still in progress elsewhere");
        self.record(identity, "in_progress");
        Err(GateError::RefreshInProgress {
            identity: identity.clone(),
        })
    }

    /// Drops local locks nobody is holding or waiting on.
    pub fn prune_local_locks(&self) -> usize {
        let before = self.local_locks.len();
        self.local_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.local_locks.len())
    }

    fn record(&self, identity: &Identity, outcome: &'static str) {
        self.metrics.increment(
            names::CREDENTIAL_REFRESH,
            &MetricLabels::new(&identity.provider, "", outcome),
        );
    }
}
