use anyhow::{Context, Result};
use async_trait::async_trait;
use credgate::credentials::Credential;
use credgate::gateway::{AdapterError, DownstreamAdapter, Outcome};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

fn default_user_agent() -> String {
    "credgate/0.1".to_string()
}

fn default_method() -> String {
    "POST".to_string()
}

/// One provider's REST endpoints, keyed by action id.
///
/// Deserializes from a table in the embedding service's own config. The
/// service builds an [`HttpActionAdapter`] from it and hands the adapter to
/// `credgate::Gate::connect`.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpAdapterConfig {
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_method")]
    pub method: String,
    /// `{field}` segments are filled from params and left out of the body.
    pub path: String,
}

impl EndpointConfig {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
        }
    }
}

/// Executes actions as authenticated JSON requests.
pub struct HttpActionAdapter {
    provider: String,
    config: HttpAdapterConfig,
    http_client: Client,
}

impl HttpActionAdapter {
    pub fn new(provider: impl Into<String>, config: HttpAdapterConfig) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent(&config.user_agent)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            provider: provider.into(),
            config,
            http_client,
        })
    }

    pub fn endpoint(&self, action_id: &str) -> Option<&EndpointConfig> {
        self.config.endpoints.get(action_id)
    }
}

#[async_trait]
impl DownstreamAdapter for HttpActionAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn invoke(
        &self,
        action_id: &str,
        params: &Value,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Outcome, AdapterError> {
        let endpoint = self.endpoint(action_id).ok_or_else(|| AdapterError::Client {
            status: 404,
            detail: format!("no endpoint configured for action '{}'", action_id),
        })?;
        let method = Method::from_bytes(endpoint.method.to_ascii_uppercase().as_bytes()).map_err(|_| {
            AdapterError::Client {
                status: 405,
                detail: format!("invalid method '{}'", endpoint.method),
            }
        })?;

        let mut body = params.as_object().cloned().unwrap_or_default();
        let path = render_path(&endpoint.path, &mut body)?;
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);

        debug!(provider = %self.provider, action = %action_id, method = %method, path = %path, "Calling downstream");

        let mut request = self
            .http_client
            .request(method.clone(), &url)
            .bearer_auth(&credential.access_token)
            .header("Accept", "application/json")
            .timeout(timeout);
        if method != Method::GET && method != Method::DELETE {
            request = request.json(&Value::Object(body));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AdapterError::Timeout
            } else if e.is_connect() {
                AdapterError::Connect {
                    detail: e.to_string(),
                }
            } else {
                AdapterError::Network {
                    detail: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                AdapterError::Timeout
            } else {
                AdapterError::Network {
                    detail: format!("failed to read response body: {}", e),
                }
            }
        })?;

        if !status.is_success() {
            return Err(AdapterError::from_status(status.as_u16(), text));
        }

        let result = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(Outcome { result })
    }
}

/// Substitutes `{field}` segments, removing the used fields from `body`.
fn render_path(template: &str, body: &mut Map<String, Value>) -> Result<String, AdapterError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| AdapterError::Client {
            status: 400,
            detail: format!("unterminated path parameter in '{}'", template),
        })?;
        let field = &after[..close];
        let value = match body.remove(field) {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(AdapterError::Client {
                    status: 400,
                    detail: format!("missing path parameter '{}'", field),
                })
            }
        };
        out.push_str(&urlencoding::encode(&value));
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
