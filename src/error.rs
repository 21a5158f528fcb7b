//! Bounded error taxonomy shared by every component.
//!
//! [`GateError`] is what callers match on. [`ErrorReason`] is the stable,
//! low-cardinality label derived from it for metrics and API payloads.

use crate::credentials::{CodecError, Identity};
use crate::gateway::{DownstreamFailure, ValidationError};
use crate::kv::KvError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a provider refresh call failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshFailure {
    /// The grant is permanently dead; the actor must re-authorize.
    InvalidGrant,
    /// Network error, timeout or provider 5xx; retry on next use.
    Transient,
}

impl fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshFailure::InvalidGrant => write!(f, "invalid_grant"),
            RefreshFailure::Transient => write!(f, "transient"),
        }
    }
}

/// Stable label set for telemetry and client-facing error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    CredentialMissing,
    CredentialExpired,
    RefreshInProgress,
    RefreshInvalidGrant,
    RefreshTransient,
    RateLimited,
    PreviewNotFound,
    ValidationError,
    AuthRequired,
    DownstreamClientError,
    DownstreamServerError,
    DownstreamTimeout,
    DownstreamNetworkError,
    ExecutionInProgress,
    AuthorizationStateInvalid,
    Internal,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::CredentialMissing => "credential_missing",
            ErrorReason::CredentialExpired => "credential_expired",
            ErrorReason::RefreshInProgress => "refresh_in_progress",
            ErrorReason::RefreshInvalidGrant => "refresh_invalid_grant",
            ErrorReason::RefreshTransient => "refresh_transient",
            ErrorReason::RateLimited => "rate_limited",
            ErrorReason::PreviewNotFound => "preview_not_found",
            ErrorReason::ValidationError => "validation_error",
            ErrorReason::AuthRequired => "auth_required",
            ErrorReason::DownstreamClientError => "downstream_client_error",
            ErrorReason::DownstreamServerError => "downstream_server_error",
            ErrorReason::DownstreamTimeout => "downstream_timeout",
            ErrorReason::DownstreamNetworkError => "downstream_network_error",
            ErrorReason::ExecutionInProgress => "execution_in_progress",
            ErrorReason::AuthorizationStateInvalid => "authorization_state_invalid",
            ErrorReason::Internal => "internal",
        }
    }

    /// Whether a caller may retry the same request later and expect a
    /// different result.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorReason::RefreshInProgress
                | ErrorReason::RefreshTransient
                | ErrorReason::RateLimited
                | ErrorReason::DownstreamServerError
                | ErrorReason::DownstreamTimeout
                | ErrorReason::DownstreamNetworkError
                | ErrorReason::ExecutionInProgress
        )
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the credential, refresh and gateway operations.
///
/// Messages carry identities and bounded reasons only; token values and key
/// material never appear here.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("no credential stored for {identity}")]
    CredentialMissing { identity: Identity },

    #[error("credential for {identity} has expired and cannot be refreshed; re-authorize to continue")]
    CredentialExpired { identity: Identity },

    #[error("credential refresh for {identity} is in progress elsewhere; retry shortly")]
    RefreshInProgress { identity: Identity },

    #[error("credential refresh for {identity} failed ({kind})")]
    RefreshFailed {
        identity: Identity,
        kind: RefreshFailure,
    },

    #[error("rate limit exceeded for {client_key}")]
    RateLimited { client_key: String },

    #[error("preview {preview_id} not found or expired")]
    PreviewNotFound { preview_id: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("authorization required for provider '{provider}'; re-authorize to continue")]
    AuthRequired { provider: String },

    #[error("downstream call failed: {failure}")]
    Downstream { failure: DownstreamFailure },

    #[error("an execution with this idempotency key is still in progress")]
    ExecutionInProgress,

    #[error("authorization state is invalid, expired or already used")]
    AuthorizationStateInvalid,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl GateError {
    /// Maps this error onto the bounded label set.
    pub fn reason(&self) -> ErrorReason {
        match self {
            GateError::CredentialMissing { .. } => ErrorReason::CredentialMissing,
            GateError::CredentialExpired { .. } => ErrorReason::CredentialExpired,
            GateError::RefreshInProgress { .. } => ErrorReason::RefreshInProgress,
            GateError::RefreshFailed {
                kind: RefreshFailure::InvalidGrant,
                ..
            } => ErrorReason::RefreshInvalidGrant,
            GateError::RefreshFailed {
                kind: RefreshFailure::Transient,
                ..
            } => ErrorReason::RefreshTransient,
            GateError::RateLimited { .. } => ErrorReason::RateLimited,
            GateError::PreviewNotFound { .. } => ErrorReason::PreviewNotFound,
            GateError::Validation(_) => ErrorReason::ValidationError,
            GateError::AuthRequired { .. } => ErrorReason::AuthRequired,
            GateError::Downstream { failure } => failure.reason(),
            GateError::ExecutionInProgress => ErrorReason::ExecutionInProgress,
            GateError::AuthorizationStateInvalid => ErrorReason::AuthorizationStateInvalid,
            GateError::Codec(_) | GateError::Storage(_) => ErrorReason::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.reason().is_retryable()
    }
}

impl From<KvError> for GateError {
    fn from(e: KvError) -> Self {
        GateError::Storage(anyhow::Error::new(e))
    }
}
