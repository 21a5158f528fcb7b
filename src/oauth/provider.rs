//! OAuth provider configurations.

use serde::Deserialize;
use std::fmt;

/// OAuth 2.0 endpoints and client registration for one provider.
#[derive(Clone, Deserialize)]
pub struct ProviderConfig {
    /// Authorization endpoint URL
    pub auth_url: String,

    /// Token endpoint URL, used for code exchange and refresh
    pub token_url: String,

    #[serde(default)]
    pub scopes: Vec<String>,

    /// Client ID; falls back to `CREDGATE_OAUTH_<PROVIDER>_CLIENT_ID`
    #[serde(default)]
    pub client_id: String,

    /// Client secret; falls back to `CREDGATE_OAUTH_<PROVIDER>_CLIENT_SECRET`
    #[serde(default)]
    pub client_secret: String,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("scopes", &self.scopes)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl ProviderConfig {
    /// Fills missing client credentials from the environment.
    pub fn fill_client_from_env(&mut self, provider: &str) {
        let env_prefix = provider.to_uppercase().replace('-', "_");
        if self.client_id.is_empty() {
            if let Ok(client_id) = std::env::var(format!("CREDGATE_OAUTH_{}_CLIENT_ID", env_prefix)) {
                self.client_id = client_id;
            }
        }
        if self.client_secret.is_empty() {
            if let Ok(client_secret) =
                std::env::var(format!("CREDGATE_OAUTH_{}_CLIENT_SECRET", env_prefix))
            {
                self.client_secret = client_secret;
            }
        }
    }

    /// Build the authorization URL with state, redirect_uri and an S256
    /// PKCE challenge.
    pub fn build_auth_url(&self, state: &str, redirect_uri: &str, code_challenge: &str) -> String {
        let scopes = self.scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code&code_challenge={}&code_challenge_method=S256",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state),
            urlencoding::encode(code_challenge)
        )
    }

    /// Form fields identifying this client to the token endpoint. Empty
    /// values are left out for public clients.
    pub(crate) fn client_form(&self) -> Vec<(&'static str, String)> {
        let mut form = Vec::new();
        if !self.client_id.is_empty() {
            form.push(("client_id", self.client_id.clone()));
        }
        if !self.client_secret.is_empty() {
            form.push(("client_secret", self.client_secret.clone()));
        }
        form
    }
}
