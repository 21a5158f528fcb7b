//! Wires every component from a [`GateConfig`].

use crate::config::{CacheBackend, GateConfig};
use crate::credentials::{Actor, Codec, Credential, CredentialCache, CredentialStore, DurableStore};
use crate::error::GateError;
use crate::gateway::{ActionRegistry, DownstreamAdapter, ExecutionGateway, RecordStore};
use crate::kv::{DistributedCache, MemoryKv, NatsKv};
use crate::metrics::MetricsRecorder;
use crate::oauth::{exchange_code, AuthorizationStateStore};
use crate::rate_limit::RateLimiter;
use crate::refresh::{OAuthRefresher, RefreshCoordinator};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rate-limit buckets idle this long are dropped by [`Gate::maintain`].
const BUCKET_IDLE: Duration = Duration::from_secs(600);

/// A fully wired credential gate.
pub struct Gate {
    pub config: GateConfig,
    pub store: Arc<CredentialStore>,
    pub refresh: Arc<RefreshCoordinator>,
    pub limiter: Arc<RateLimiter>,
    pub gateway: Arc<ExecutionGateway>,
    pub authorizations: AuthorizationStateStore,
    pub metrics: Arc<MetricsRecorder>,
    /// Set when records live in process memory and need purging.
    local_kv: Option<Arc<MemoryKv>>,
    http_client: reqwest::Client,
}

impl Gate {
    pub async fn connect(config: GateConfig, adapters: Vec<Arc<dyn DownstreamAdapter>>) -> Result<Self> {
        let metrics = Arc::new(MetricsRecorder::new());

        let codec = Codec::from_config(&config.encryption, config.environment)
            .context("Failed to load encryption key")?;
        let durable = DurableStore::open(&config.database.path)
            .with_context(|| format!("Failed to open credential database {}", config.database.path))?;
        info!(path = %config.database.path, "Credential database opened");

        let shared: Option<Arc<dyn DistributedCache>> = match config.cache.backend {
            CacheBackend::None | CacheBackend::Memory => None,
            CacheBackend::Nats => match NatsKv::connect(&config.cache.nats).await {
                Ok(kv) => Some(Arc::new(kv)),
                Err(e) => {
                    warn!(error = %e, "Distributed cache unreachable at startup, coordinating in-process only");
                    None
                }
            },
        };

        // Previews, idempotency records and OAuth states need a store even
        // without a shared cache.
        let (records_kv, local_kv) = match &shared {
            Some(kv) => (Arc::clone(kv), None),
            None => {
                let memory = Arc::new(MemoryKv::new());
                let records: Arc<dyn DistributedCache> = memory.clone();
                (records, Some(memory))
            }
        };

        // The credential cache and refresh lock follow the configured backend
        let coordination_kv = match config.cache.backend {
            CacheBackend::None => None,
            _ => Some(Arc::clone(&records_kv)),
        };

        let cache = coordination_kv
            .clone()
            .map(|kv| CredentialCache::new(kv, metrics.clone()));
        let store = Arc::new(CredentialStore::new(durable, codec, cache));

        let refresher = OAuthRefresher::new(config.providers.clone(), config.refresh.request_timeout())?;
        let refresh = Arc::new(RefreshCoordinator::new(
            Arc::clone(&store),
            coordination_kv.clone(),
            Arc::new(refresher),
            config.refresh.clone(),
            metrics.clone(),
        ));

        let limiter = Arc::new(RateLimiter::new(&config.rate_limit, shared.clone(), metrics.clone()).await);

        let mut registry = ActionRegistry::new();
        for spec in &config.actions {
            registry.register(spec.clone());
        }
        let records = RecordStore::new(
            Arc::clone(&records_kv),
            config.gateway.preview_ttl(),
            config.gateway.idempotency_ttl(),
        );
        let mut gateway = ExecutionGateway::new(
            registry,
            records,
            Arc::clone(&limiter),
            Arc::clone(&refresh),
            config.gateway.clone(),
            metrics.clone(),
        );
        for adapter in adapters {
            info!(provider = %adapter.provider(), "Downstream adapter registered");
            gateway = gateway.with_adapter(adapter);
        }

        let http_client = reqwest::Client::builder()
            .timeout(config.refresh.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        info!(
            environment = ?config.environment,
            cache = ?config.cache.backend,
            rate_limit = %limiter.strategy(),
            actions = config.actions.len(),
            providers = config.providers.len(),
            "Credential gate ready"
        );

        Ok(Self {
            authorizations: AuthorizationStateStore::new(records_kv),
            gateway: Arc::new(gateway),
            config,
            store,
            refresh,
            limiter,
            metrics,
            local_kv,
            http_client,
        })
    }

    /// Starts an authorization flow and returns the URL to send the user to.
    pub async fn begin_authorization(
        &self,
        workspace_id: &str,
        provider: &str,
        redirect_uri: &str,
    ) -> Result<String, GateError> {
        let provider_config = self
            .config
            .providers
            .get(provider)
            .ok_or_else(|| anyhow!("provider '{}' is not configured", provider))?;

        let (state, challenge) = self
            .authorizations
            .begin(workspace_id, provider, redirect_uri)
            .await?;
        Ok(provider_config.build_auth_url(&state.nonce, redirect_uri, &challenge))
    }

    /// Completes a flow: consumes the state, exchanges the code and stores
    /// the resulting credential for `actor`.
    pub async fn complete_authorization(
        &self,
        nonce: &str,
        provider: &str,
        code: &str,
        actor: &Actor,
    ) -> Result<Credential, GateError> {
        let state = self.authorizations.consume(nonce, provider).await?;
        if state.workspace_id != actor.workspace_id {
            warn!(provider = %provider, "Authorization state used from another workspace");
            return Err(GateError::AuthorizationStateInvalid);
        }

        let provider_config = self
            .config
            .providers
            .get(provider)
            .ok_or_else(|| anyhow!("provider '{}' is not configured", provider))?;
        let grant = exchange_code(
            &self.http_client,
            provider_config,
            code,
            &state.redirect_uri,
            &state.code_verifier,
        )
        .await?;

        let identity = actor.identity_for(provider);
        let previous = match self.store.get(&identity).await {
            Ok(previous) => previous,
            Err(e) => {
                // A refresh token the provider did not re-issue is lost here
                warn!(identity = %identity, error = %e, "Previous credential unreadable, storing the new grant alone");
                None
            }
        };
        let credential = grant.into_credential(identity, previous.as_ref(), Utc::now());
        self.store.store(&credential).await?;

        info!(identity = %credential.identity, expires_at = %credential.expires_at, "Authorization completed");
        Ok(credential)
    }

    /// Periodic housekeeping: idle rate-limit buckets, unused local refresh
    /// locks and expired in-process records.
    pub fn maintain(&self) {
        let buckets = self.limiter.purge_idle(BUCKET_IDLE);
        let locks = self.refresh.prune_local_locks();
        let records = self.local_kv.as_ref().map_or(0, |kv| kv.purge_expired());
        debug!(buckets, locks, records, "Maintenance pass");
    }

    /// Runs [`Gate::maintain`] every `interval` until the task is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                gate.maintain();
            }
        })
    }
}
