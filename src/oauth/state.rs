//! One-time authorization state for CSRF and PKCE.
//!
//! States live in the distributed cache so any worker can finish a flow
//! another worker started. Validation consumes the entry with an atomic
//! get-and-delete, so a nonce can be spent once even under concurrent
//! callbacks, and a failed validation spends it too.

use super::pkce::{generate_code_challenge, generate_code_verifier, generate_state};
use crate::error::GateError;
use crate::kv::{key_part, DistributedCache};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default lifetime of an authorization state.
pub const STATE_TTL: Duration = Duration::from_secs(600);

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationState {
    pub nonce: String,
    pub workspace_id: String,
    pub provider: String,
    pub redirect_uri: String,
    pub code_verifier: String,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for AuthorizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationState")
            .field("nonce", &self.nonce)
            .field("workspace_id", &self.workspace_id)
            .field("provider", &self.provider)
            .field("redirect_uri", &self.redirect_uri)
            .field("code_verifier", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Authorization state store with automatic expiration
#[derive(Clone)]
pub struct AuthorizationStateStore {
    kv: Arc<dyn DistributedCache>,
    ttl: Duration,
}

impl AuthorizationStateStore {
    pub fn new(kv: Arc<dyn DistributedCache>) -> Self {
        Self::with_ttl(kv, STATE_TTL)
    }

    pub fn with_ttl(kv: Arc<dyn DistributedCache>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    fn key(nonce: &str) -> String {
        format!("oauth-state:{}", key_part(nonce))
    }

    /// Starts a flow. Returns the stored state and the S256 code challenge
    /// to put in the authorization URL.
    pub async fn begin(
        &self,
        workspace_id: &str,
        provider: &str,
        redirect_uri: &str,
    ) -> Result<(AuthorizationState, String), GateError> {
        let state = AuthorizationState {
            nonce: generate_state(),
            workspace_id: workspace_id.to_string(),
            provider: provider.to_string(),
            redirect_uri: redirect_uri.to_string(),
            code_verifier: generate_code_verifier(),
            created_at: Utc::now(),
        };
        let challenge = generate_code_challenge(&state.code_verifier);

        let payload = serde_json::to_vec(&state).map_err(anyhow::Error::from)?;
        self.kv.set(&Self::key(&state.nonce), payload, self.ttl).await?;

        debug!(workspace_id = %workspace_id, provider = %provider, "Authorization flow started");
        Ok((state, challenge))
    }

    /// Validates and consumes a state. Succeeds at most once per nonce.
    pub async fn consume(&self, nonce: &str, provider: &str) -> Result<AuthorizationState, GateError> {
        let Some(payload) = self.kv.take(&Self::key(nonce)).await? else {
            warn!(provider = %provider, "Unknown, expired or reused authorization state");
            return Err(GateError::AuthorizationStateInvalid);
        };

        let state: AuthorizationState =
            serde_json::from_slice(&payload).map_err(|_| GateError::AuthorizationStateInvalid)?;

        let age = Utc::now() - state.created_at;
        let expired = age.to_std().map(|age| age > self.ttl).unwrap_or(false);
        if expired {
            warn!(provider = %provider, "Authorization state expired");
            return Err(GateError::AuthorizationStateInvalid);
        }

        if state.provider != provider {
            warn!(
                expected = %state.provider,
                got = %provider,
                "Authorization state used for a different provider"
            );
            return Err(GateError::AuthorizationStateInvalid);
        }

        Ok(state)
    }
}
