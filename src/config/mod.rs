use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

// Re-export config types owned by their modules
pub use crate::gateway::ActionSpec;
pub use crate::kv::NatsKvConfig;
pub use crate::oauth::ProviderConfig;

/// Deployment environment. Only production refuses to start without an
/// encryption key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

/// Complete credgate configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// OAuth providers keyed by name (e.g. "github")
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// Action contracts (`[[actions]]`)
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

/// Encryption key source
#[derive(Clone, Deserialize)]
pub struct EncryptionConfig {
    /// Inline base64 key. Prefer `key_env` outside of tests.
    #[serde(default)]
    pub key: Option<String>,
    /// Environment variable holding the base64 key
    #[serde(default = "default_key_env")]
    pub key_env: String,
}

fn default_key_env() -> String {
    "CREDGATE_ENCRYPTION_KEY".to_string()
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key: None,
            key_env: default_key_env(),
        }
    }
}

impl fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("key_env", &self.key_env)
            .finish()
    }
}

/// Durable store location
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "credentials.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// No distributed cache: durable reads only, local rate limiting
    None,
    /// Process-local cache
    #[default]
    Memory,
    /// NATS JetStream key-value bucket shared by all workers
    Nats,
}

/// Fast cache configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    #[serde(default)]
    pub nats: NatsKvConfig,
}

/// Refresh coordination
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Credentials expiring within this margin are refreshed
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
    /// Refresh lock TTL; bounds how long a crashed holder can block others
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Delay between re-reads while another worker refreshes
    #[serde(default = "default_wait_delay_ms")]
    pub wait_delay_ms: u64,
    #[serde(default = "default_max_wait_attempts")]
    pub max_wait_attempts: u32,
    /// Timeout for the provider refresh call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_safety_margin_secs() -> u64 {
    120
}

fn default_lock_ttl_secs() -> u64 {
    10
}

fn default_wait_delay_ms() -> u64 {
    250
}

fn default_max_wait_attempts() -> u32 {
    4
}

fn default_request_timeout_secs() -> u64 {
    8
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: default_safety_margin_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            wait_delay_ms: default_wait_delay_ms(),
            max_wait_attempts: default_max_wait_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl RefreshConfig {
    pub fn safety_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.safety_margin_secs as i64)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs.clamp(1, 10))
    }

    pub fn wait_delay(&self) -> Duration {
        Duration::from_millis(self.wait_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Longest one `get_with_auto_refresh` call can take: waiting out a
    /// local holder's refresh, its own refresh, or the full wait budget.
    pub fn max_duration(&self) -> Duration {
        let waiting = self.wait_delay() * self.max_wait_attempts;
        (self.request_timeout() * 2).max(waiting + self.request_timeout())
    }
}

/// Admission control
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    /// Requests allowed per client key per window (distributed strategy)
    #[serde(default = "default_limit_per_window")]
    pub limit_per_window: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Token bucket capacity (in-process strategy)
    #[serde(default = "default_bucket_capacity")]
    pub bucket_capacity: u64,
    /// Token bucket refill rate, tokens per second
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
    /// Longest a backend outage may be answered with blanket allow before
    /// decisions fall back to the in-process bucket
    #[serde(default = "default_max_fail_open_secs")]
    pub max_fail_open_secs: u64,
}

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_limit_per_window() -> u64 {
    600
}

fn default_window_secs() -> u64 {
    60
}

fn default_bucket_capacity() -> u64 {
    600
}

fn default_refill_per_sec() -> f64 {
    10.0
}

fn default_max_fail_open_secs() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            limit_per_window: default_limit_per_window(),
            window_secs: default_window_secs(),
            bucket_capacity: default_bucket_capacity(),
            refill_per_sec: default_refill_per_sec(),
            max_fail_open_secs: default_max_fail_open_secs(),
        }
    }
}

/// Preview/execute behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_preview_ttl_secs")]
    pub preview_ttl_secs: u64,
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
    /// Upper bound on one downstream adapter call
    #[serde(default = "default_adapter_timeout_secs")]
    pub adapter_timeout_secs: u64,
    /// How often a duplicate execute polls for the first call's outcome
    #[serde(default = "default_claim_poll_ms")]
    pub claim_poll_ms: u64,
}

fn default_preview_ttl_secs() -> u64 {
    600
}

fn default_idempotency_ttl_secs() -> u64 {
    86_400
}

fn default_adapter_timeout_secs() -> u64 {
    30
}

fn default_claim_poll_ms() -> u64 {
    100
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            preview_ttl_secs: default_preview_ttl_secs(),
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
            adapter_timeout_secs: default_adapter_timeout_secs(),
            claim_poll_ms: default_claim_poll_ms(),
        }
    }
}

impl GatewayConfig {
    pub fn preview_ttl(&self) -> Duration {
        Duration::from_secs(self.preview_ttl_secs)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    /// Claim TTL once the call is admitted: the adapter call plus the
    /// record write.
    pub fn claim_ttl(&self) -> Duration {
        self.adapter_timeout() + Duration::from_secs(5)
    }

    pub fn claim_poll(&self) -> Duration {
        Duration::from_millis(self.claim_poll_ms.max(1))
    }
}

impl GateConfig {
    /// Applies `CREDGATE_*` environment overrides on top of file values.
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("CREDGATE_ENVIRONMENT") {
            if let Ok(env) = v.parse() {
                self.environment = env;
            }
        }
        if let Ok(v) = std::env::var("CREDGATE_DATABASE_PATH") {
            self.database.path = v;
        }
        if let Ok(v) = std::env::var("CREDGATE_CACHE_BACKEND") {
            match v.to_ascii_lowercase().as_str() {
                "none" => self.cache.backend = CacheBackend::None,
                "memory" => self.cache.backend = CacheBackend::Memory,
                "nats" => self.cache.backend = CacheBackend::Nats,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("CREDGATE_NATS_URL") {
            self.cache.nats.url = v;
        }
        if let Ok(v) = std::env::var("CREDGATE_RATE_LIMIT_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                self.rate_limit.enabled = b;
            }
        }
        if let Ok(v) = std::env::var("CREDGATE_RATE_LIMIT_PER_WINDOW") {
            if let Ok(n) = v.parse::<u64>() {
                self.rate_limit.limit_per_window = n;
            }
        }
        for (name, provider) in self.providers.iter_mut() {
            provider.fill_client_from_env(name);
        }
        self
    }
}

/// Load configuration from a TOML file, then apply environment overrides
pub fn load_config(path: &str) -> Result<GateConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: GateConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config.apply_env())
}
