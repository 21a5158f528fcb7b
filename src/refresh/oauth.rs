//! Standard OAuth 2.0 `refresh_token` grant.

use super::{RefreshError, TokenRefresher};
use crate::credentials::Credential;
use crate::oauth::{ProviderConfig, TokenGrant};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

/// OAuth `error` codes meaning the grant itself is dead.
const TERMINAL_ERRORS: &[&str] = &[
    "invalid_grant",
    "invalid_client",
    "unauthorized_client",
    // GitHub answers 200 with this code for revoked or expired refresh tokens
    "bad_refresh_token",
];

/// Refreshes tokens against each provider's token endpoint.
pub struct OAuthRefresher {
    providers: HashMap<String, ProviderConfig>,
    http_client: reqwest::Client,
}

impl OAuthRefresher {
    pub fn new(providers: HashMap<String, ProviderConfig>, request_timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            providers,
            http_client,
        })
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, credential: &Credential) -> Result<TokenGrant, RefreshError> {
        let identity = &credential.identity;
        let provider = self.providers.get(&identity.provider).ok_or_else(|| {
            RefreshError::transient(format!("no provider configured for '{}'", identity.provider))
        })?;
        let refresh_token = credential
            .refresh_token
            .clone()
            .ok_or_else(|| RefreshError::invalid_grant("credential has no refresh token"))?;

        let mut form: Vec<(&str, String)> = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
        ];
        form.extend(provider.client_form());

        info!(
            provider = %identity.provider,
            workspace_id = %identity.workspace_id,
            actor_id = %identity.actor_id,
            "Calling provider refresh endpoint"
        );

        let response = self
            .http_client
            .post(&provider.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| RefreshError::transient(format!("refresh request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::transient(format!("failed to read refresh response: {}", e)))?;

        classify_response(status, &body)
    }
}

/// Turns a token-endpoint response into a grant or a classified failure.
fn classify_response(status: StatusCode, body: &str) -> Result<TokenGrant, RefreshError> {
    let json: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let error_code = json
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    if status.is_success() && error_code.is_none() {
        return serde_json::from_str::<TokenGrant>(body)
            .map_err(|e| RefreshError::transient(format!("failed to parse refresh response: {}", e)));
    }

    let terminal_status = status.is_success()
        || status == StatusCode::BAD_REQUEST
        || status == StatusCode::UNAUTHORIZED;
    match error_code {
        Some(code) if terminal_status && TERMINAL_ERRORS.contains(&code.as_str()) => Err(
            RefreshError::invalid_grant(format!("provider rejected refresh ({}): {}", status, code)),
        ),
        Some(code) => Err(RefreshError::transient(format!(
            "provider refresh error ({}): {}",
            status, code
        ))),
        None => Err(RefreshError::transient(format!(
            "provider refresh failed with status {}",
            status
        ))),
    }
}
