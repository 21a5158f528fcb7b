//! OAuth token exchange logic.
//!
//! Handles exchanging authorization codes for tokens and turning provider
//! token responses into credentials.

use super::ProviderConfig;
use crate::credentials::{Credential, Identity};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;

/// Lifetime assumed when a provider omits `expires_in`.
pub const DEFAULT_GRANT_LIFETIME_SECS: i64 = 3600;

/// OAuth token response (standard OAuth 2.0)
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .finish()
    }
}

impl TokenGrant {
    /// Builds the credential for `identity`.
    ///
    /// When refreshing, `previous` supplies the refresh token and scope the
    /// provider did not re-send.
    pub fn into_credential(
        self,
        identity: Identity,
        previous: Option<&Credential>,
        now: DateTime<Utc>,
    ) -> Credential {
        let lifetime = self
            .expires_in
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_GRANT_LIFETIME_SECS);

        // Keep the existing refresh token if the provider did not rotate it
        let refresh_token = self
            .refresh_token
            .or_else(|| previous.and_then(|p| p.refresh_token.clone()));

        let scope = match self.scope {
            Some(raw) => parse_scope(&raw),
            None => previous.map(|p| p.scope.clone()).unwrap_or_default(),
        };

        Credential {
            identity,
            access_token: self.access_token,
            refresh_token,
            expires_at: now + Duration::seconds(lifetime),
            scope,
        }
    }
}

/// Providers separate scopes with spaces (RFC 6749) or commas (GitHub).
fn parse_scope(raw: &str) -> BTreeSet<String> {
    raw.split(|c: char| c == ' ' || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Exchange an authorization code (plus PKCE verifier) for tokens.
pub async fn exchange_code(
    client: &reqwest::Client,
    provider: &ProviderConfig,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> Result<TokenGrant> {
    let mut form: Vec<(&str, String)> = vec![
        ("grant_type", "authorization_code".to_string()),
        ("code", code.to_string()),
        ("redirect_uri", redirect_uri.to_string()),
        ("code_verifier", code_verifier.to_string()),
    ];
    form.extend(provider.client_form());

    tracing::debug!(token_url = %provider.token_url, "Exchanging authorization code for token");

    let response = client
        .post(&provider.token_url)
        .header("Accept", "application/json")
        .form(&form)
        .send()
        .await
        .context("Failed to send token exchange request")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        return Err(anyhow!(
            "Token exchange failed with status {}: {}",
            status,
            crate::gateway::redact_detail(&body)
        ));
    }

    let grant: TokenGrant = response
        .json()
        .await
        .context("Failed to parse token response")?;

    tracing::debug!(
        has_refresh_token = grant.refresh_token.is_some(),
        expires_in = ?grant.expires_in,
        "Token exchange successful"
    );

    Ok(grant)
}
