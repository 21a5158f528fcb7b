use crate::credentials::Credential;
use crate::error::ErrorReason;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const MAX_DETAIL_CHARS: usize = 256;
const REDACTED: &str = "[redacted]";

/// Markers after which the next value is masked in logged details.
const SECRET_MARKERS: &[&str] = &[
    "bearer",
    "access_token",
    "refresh_token",
    "client_secret",
    "code_verifier",
    "password",
];

/// Successful downstream result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub result: serde_json::Value,
}

/// Bounded classification of a failed downstream call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownstreamFailure {
    /// 4xx: the request itself is wrong; retrying will not help.
    ClientError,
    /// 5xx
    ServerError,
    Timeout,
    NetworkError,
}

impl DownstreamFailure {
    pub fn reason(&self) -> ErrorReason {
        match self {
            DownstreamFailure::ClientError => ErrorReason::DownstreamClientError,
            DownstreamFailure::ServerError => ErrorReason::DownstreamServerError,
            DownstreamFailure::Timeout => ErrorReason::DownstreamTimeout,
            DownstreamFailure::NetworkError => ErrorReason::DownstreamNetworkError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.reason().is_retryable()
    }
}

impl fmt::Display for DownstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason().as_str())
    }
}

/// Error returned by a [`DownstreamAdapter`]. `detail` is for logs only and
/// goes through [`redact_detail`] before it is written anywhere.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("downstream rejected the request with status {status}")]
    Client { status: u16, detail: String },

    #[error("downstream failed with status {status}")]
    Server { status: u16, detail: String },

    #[error("downstream call timed out")]
    Timeout,

    /// The connection failed before the request was sent.
    #[error("downstream unreachable")]
    Connect { detail: String },

    /// Failed after the request may have reached the provider.
    #[error("downstream network error")]
    Network { detail: String },
}

impl AdapterError {
    /// Classifies an HTTP error status.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        if (400..500).contains(&status) {
            AdapterError::Client {
                status,
                detail: detail.into(),
            }
        } else {
            AdapterError::Server {
                status,
                detail: detail.into(),
            }
        }
    }

    pub fn failure(&self) -> DownstreamFailure {
        match self {
            AdapterError::Client { .. } => DownstreamFailure::ClientError,
            AdapterError::Server { .. } => DownstreamFailure::ServerError,
            AdapterError::Timeout => DownstreamFailure::Timeout,
            AdapterError::Connect { .. } | AdapterError::Network { .. } => {
                DownstreamFailure::NetworkError
            }
        }
    }

    /// Whether the provider may have performed the side effect even though
    /// no answer came back.
    pub fn may_have_committed(&self) -> bool {
        matches!(self, AdapterError::Timeout | AdapterError::Network { .. })
    }

    pub fn detail(&self) -> &str {
        match self {
            AdapterError::Client { detail, .. }
            | AdapterError::Server { detail, .. }
            | AdapterError::Connect { detail }
            | AdapterError::Network { detail } => detail,
            AdapterError::Timeout => "",
        }
    }
}

/// Performs the side effect of an action against one provider.
#[async_trait]
pub trait DownstreamAdapter: Send + Sync {
    /// Provider whose actions this adapter executes.
    fn provider(&self) -> &str;

    /// `timeout` is the gateway's budget for this call; the gateway enforces
    /// it as well.
    async fn invoke(
        &self,
        action_id: &str,
        params: &serde_json::Value,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Outcome, AdapterError>;
}

/// Masks token-like values and truncates a provider error body so it can be
/// logged.
pub fn redact_detail(raw: &str) -> String {
    let mut masked = raw.to_string();
    for marker in SECRET_MARKERS {
        masked = mask_after(&masked, marker);
    }

    if masked.chars().count() > MAX_DETAIL_CHARS {
        let mut truncated: String = masked.chars().take(MAX_DETAIL_CHARS).collect();
        truncated.push_str("...");
        truncated
    } else {
        masked
    }
}

fn mask_after(input: &str, marker: &str) -> String {
    // ASCII lowercasing keeps byte offsets aligned with `input`
    let lower = input.to_ascii_lowercase();
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0;
    let mut search_from = 0;

    while let Some(pos) = lower[search_from..].find(marker) {
        let marker_end = search_from + pos + marker.len();
        let mut value_start = marker_end;
        while value_start < bytes.len() && matches!(bytes[value_start], b'"' | b'\'' | b':' | b'=' | b' ') {
            value_start += 1;
        }
        let mut value_end = value_start;
        while value_end < bytes.len()
            && !matches!(
                bytes[value_end],
                b'"' | b'\'' | b'&' | b',' | b'}' | b' ' | b'\n' | b'\r' | b'\t'
            )
        {
            value_end += 1;
        }

        if value_end > value_start {
            out.push_str(&input[cursor..value_start]);
            out.push_str(REDACTED);
            cursor = value_end;
        }
        search_from = value_end.max(marker_end);
    }

    out.push_str(&input[cursor..]);
    out
}
