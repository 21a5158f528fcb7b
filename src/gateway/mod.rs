//! Two-phase execution of side-effecting actions.
//!
//! `preview` validates parameters against the action's contract, computes a
//! digest and stores a short-lived [`PreviewRecord`]; nothing is sent
//! downstream. `execute` confirms a preview:
//!
//! 1. stored idempotency record for the key → return it unchanged
//! 2. unknown or expired preview → `PreviewNotFound` (no rate-limit charge)
//! 3. claim the idempotency key; a concurrent duplicate waits for the first
//!    outcome instead of calling downstream again
//! 4. rate limit, then a credential valid beyond the safety margin
//! 5. renew the claim for the adapter call and re-check for a record
//! 6. adapter call under a timeout, on a task that outlives the caller
//!
//! The claim is first taken for the whole admission budget (refresh included)
//! and renewed once admitted, so it cannot lapse while the call is pending.
//!
//! Outcomes are recorded under the idempotency key when they are final
//! (success, 4xx) or when the provider may have acted without answering
//! (timeout, failure after the request was sent). A retry with the same key
//! replays those. A 5xx or a connection that never opened releases the claim
//! without a record, so a retry runs again.

mod actions;
mod adapter;
mod records;

pub use actions::{canonical_json, ActionRegistry, ActionSpec, ValidationError};
pub use adapter::{redact_detail, AdapterError, DownstreamAdapter, DownstreamFailure, Outcome};
pub use records::{IdempotencyRecord, PreviewRecord, RecordStore};

use crate::config::GatewayConfig;
use crate::credentials::{Actor, Credential};
use crate::error::{ErrorReason, GateError, RefreshFailure};
use crate::kv::Lease;
use crate::metrics::{names, MetricLabels, MetricsSink};
use crate::rate_limit::{client_key, RateLimiter};
use crate::refresh::RefreshCoordinator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub preview_id: String,
    pub action_id: String,
    pub summary: String,
    pub warnings: Vec<String>,
    pub digest: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
}

/// Result of an execute call. Downstream failures are reported here with a
/// bounded reason; gate-level failures are `GateError`s instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub status: ExecutionStatus,
    pub preview_id: String,
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ErrorReason>,
    pub retryable: bool,
}

impl ExecuteResponse {
    fn succeeded(preview: &PreviewRecord, result: serde_json::Value) -> Self {
        Self {
            status: ExecutionStatus::Succeeded,
            preview_id: preview.preview_id.clone(),
            action_id: preview.action_id.clone(),
            result: Some(result),
            reason: None,
            retryable: false,
        }
    }

    fn failed(preview: &PreviewRecord, failure: DownstreamFailure) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            preview_id: preview.preview_id.clone(),
            action_id: preview.action_id.clone(),
            result: None,
            reason: Some(failure.reason()),
            retryable: failure.is_retryable(),
        }
    }

    /// No answer came back but the provider may have acted. The key is spent;
    /// retrying under it replays this response.
    fn unconfirmed(preview: &PreviewRecord, failure: DownstreamFailure) -> Self {
        Self {
            retryable: false,
            ..Self::failed(preview, failure)
        }
    }

    fn reason_label(&self) -> &'static str {
        self.reason.map_or("success", |r| r.as_str())
    }
}

pub struct ExecutionGateway {
    registry: ActionRegistry,
    records: RecordStore,
    limiter: Arc<RateLimiter>,
    refresh: Arc<RefreshCoordinator>,
    adapters: HashMap<String, Arc<dyn DownstreamAdapter>>,
    config: GatewayConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl ExecutionGateway {
    pub fn new(
        registry: ActionRegistry,
        records: RecordStore,
        limiter: Arc<RateLimiter>,
        refresh: Arc<RefreshCoordinator>,
        config: GatewayConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            records,
            limiter,
            refresh,
            adapters: HashMap::new(),
            config,
            metrics,
        }
    }

    /// Registers the adapter for its provider, replacing any previous one.
    pub fn with_adapter(mut self, adapter: Arc<dyn DownstreamAdapter>) -> Self {
        self.adapters.insert(adapter.provider().to_string(), adapter);
        self
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Validates an action and stores it for later confirmation.
    pub async fn preview(
        &self,
        actor: &Actor,
        action_id: &str,
        params: serde_json::Value,
    ) -> Result<PreviewResponse, GateError> {
        let spec = match self.registry.resolve(action_id) {
            Ok(spec) => spec,
            Err(e) => {
                self.metrics
                    .increment(names::PREVIEW, &MetricLabels::reason(ErrorReason::ValidationError.as_str()));
                return Err(e.into());
            }
        };
        if let Err(e) = spec.validate(&params) {
            debug!(action = %spec.id, error = %e, "Preview rejected");
            self.metrics.increment(
                names::PREVIEW,
                &MetricLabels::new(&spec.provider, &spec.id, ErrorReason::ValidationError.as_str()),
            );
            return Err(e.into());
        }

        let mut warnings = Vec::new();
        if !self.adapters.contains_key(&spec.provider) {
            warnings.push(format!(
                "no downstream adapter is configured for provider '{}'",
                spec.provider
            ));
        }
        match self.refresh.store().get(&actor.identity_for(&spec.provider)).await {
            Ok(Some(_)) => {}
            Ok(None) => warnings.push(format!(
                "authorization required for provider '{}' before this action can run",
                spec.provider
            )),
            Err(e) => warn!(provider = %spec.provider, error = %e, "Credential lookup failed during preview"),
        }

        let created_at = Utc::now();
        let record = PreviewRecord {
            preview_id: Uuid::new_v4().to_string(),
            action_id: spec.id.clone(),
            provider: spec.provider.clone(),
            actor: actor.clone(),
            digest: spec.digest(&params),
            params,
            created_at,
        };
        self.records.put_preview(&record).await?;

        info!(
            preview_id = %record.preview_id,
            action = %record.action_id,
            workspace_id = %actor.workspace_id,
            "Preview created"
        );
        self.metrics
            .increment(names::PREVIEW, &MetricLabels::new(&spec.provider, &spec.id, "created"));

        Ok(PreviewResponse {
            summary: spec.render_summary(&record.params),
            preview_id: record.preview_id,
            action_id: record.action_id,
            warnings,
            digest: record.digest,
            expires_at: created_at + chrono::Duration::seconds(self.config.preview_ttl_secs as i64),
        })
    }

    /// Confirms a preview and performs its side effect at most once per
    /// idempotency key.
    ///
    /// A key is bound to the preview it first executed: reusing it for a
    /// different preview fails with
    /// [`ValidationError::IdempotencyKeyReused`] instead of returning the
    /// other preview's stored response.
    pub async fn execute(
        &self,
        preview_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<ExecuteResponse, GateError> {
        if let Some(key) = idempotency_key {
            if let Some(record) = self.records.get_idempotency(key).await? {
                return self.replay(record, preview_id);
            }
        }

        let Some(preview) = self.records.get_preview(preview_id).await? else {
            self.metrics
                .increment(names::EXECUTION, &MetricLabels::reason(ErrorReason::PreviewNotFound.as_str()));
            return Err(GateError::PreviewNotFound {
                preview_id: preview_id.to_string(),
            });
        };

        let claim = match idempotency_key {
            None => None,
            Some(key) => match self.records.claim(key, self.admission_claim_ttl()).await? {
                Some(lease) => {
                    // The first execution may have finished between our read and the claim
                    if let Some(record) = self.records.get_idempotency(key).await? {
                        lease.release().await;
                        return self.replay(record, preview_id);
                    }
                    Some(lease)
                }
                None => return self.await_first_execution(key, preview_id).await,
            },
        };

        let (credential, adapter) = match self.admit(&preview).await {
            Ok(admitted) => admitted,
            Err(e) => {
                if let Some(lease) = claim {
                    lease.release().await;
                }
                info!(preview_id = %preview_id, reason = %e.reason(), "Execution refused");
                self.metrics.increment(
                    names::EXECUTION,
                    &MetricLabels::new(&preview.provider, &preview.action_id, e.reason().as_str()),
                );
                return Err(e);
            }
        };

        let claim = match (claim, idempotency_key) {
            (Some(mut lease), Some(key)) => {
                if !lease.renew(self.config.claim_ttl()).await? {
                    info!(preview_id = %preview_id, "Claim taken over during admission");
                    return self.await_first_execution(key, preview_id).await;
                }
                // A lapsed claim may have let another execution finish
                if let Some(record) = self.records.get_idempotency(key).await? {
                    lease.release().await;
                    return self.replay(record, preview_id);
                }
                Some(lease)
            }
            (claim, _) => claim,
        };

        let execution = Execution {
            adapter,
            records: self.records.clone(),
            metrics: Arc::clone(&self.metrics),
            preview,
            credential,
            timeout: self.config.adapter_timeout(),
            idempotency_key: idempotency_key.map(str::to_string),
            started: Instant::now(),
        };

        // Spawned so a dropped caller cannot abandon a side effect halfway
        match tokio::spawn(execution.run(claim)).await {
            Ok(response) => Ok(response),
            Err(e) => Err(GateError::Storage(anyhow::anyhow!("execution task failed: {}", e))),
        }
    }

    /// Initial claim TTL: admission, which may include a refresh, plus the
    /// adapter call.
    fn admission_claim_ttl(&self) -> Duration {
        self.refresh.max_duration() + self.config.claim_ttl()
    }

    /// Checks everything that must hold before the downstream call.
    async fn admit(
        &self,
        preview: &PreviewRecord,
    ) -> Result<(Credential, Arc<dyn DownstreamAdapter>), GateError> {
        let adapter = self.adapters.get(&preview.provider).cloned().ok_or_else(|| {
            GateError::Storage(anyhow::anyhow!(
                "no downstream adapter configured for provider '{}'",
                preview.provider
            ))
        })?;

        let key = client_key(&preview.actor.workspace_id, &preview.provider);
        if !self.limiter.allow(&key).await {
            return Err(GateError::RateLimited { client_key: key });
        }

        let identity = preview.actor.identity_for(&preview.provider);
        let credential = self
            .refresh
            .get_with_auto_refresh(&identity)
            .await
            .map_err(|e| require_authorization(e, &preview.provider))?;

        Ok((credential, adapter))
    }

    /// A concurrent execute holds the claim: wait for its record.
    async fn await_first_execution(
        &self,
        key: &str,
        preview_id: &str,
    ) -> Result<ExecuteResponse, GateError> {
        let deadline = Instant::now() + self.admission_claim_ttl();
        while Instant::now() < deadline {
            tokio::time::sleep(self.config.claim_poll()).await;

            // Claim first: the record is written before the claim is released
            let active = self.records.claim_active(key).await?;
            if let Some(record) = self.records.get_idempotency(key).await? {
                return self.replay(record, preview_id);
            }
            if !active {
                // Released without a record: the first attempt failed retryably
                break;
            }
        }

        debug!(preview_id = %preview_id, "No outcome recorded for concurrent execution");
        self.metrics
            .increment(names::EXECUTION, &MetricLabels::reason(ErrorReason::ExecutionInProgress.as_str()));
        Err(GateError::ExecutionInProgress)
    }

    fn replay(&self, record: IdempotencyRecord, preview_id: &str) -> Result<ExecuteResponse, GateError> {
        if record.preview_id != preview_id {
            warn!(preview_id = %preview_id, "Idempotency key reused for a different preview");
            return Err(ValidationError::IdempotencyKeyReused.into());
        }
        debug!(
            preview_id = %preview_id,
            completed_at = %record.completed_at,
            "Replaying recorded execution"
        );
        self.metrics.increment(
            names::EXECUTION,
            &MetricLabels::new("", &record.response.action_id, "replayed"),
        );
        Ok(record.response)
    }
}

/// Credential problems the actor can only fix by re-authorizing.
fn require_authorization(err: GateError, provider: &str) -> GateError {
    match err {
        GateError::CredentialMissing { .. }
        | GateError::CredentialExpired { .. }
        | GateError::RefreshFailed {
            kind: RefreshFailure::InvalidGrant,
            ..
        } => GateError::AuthRequired {
            provider: provider.to_string(),
        },
        other => other,
    }
}

/// One downstream call plus its bookkeeping, owned by a spawned task.
struct Execution {
    adapter: Arc<dyn DownstreamAdapter>,
    records: RecordStore,
    metrics: Arc<dyn MetricsSink>,
    preview: PreviewRecord,
    credential: Credential,
    timeout: Duration,
    idempotency_key: Option<String>,
    started: Instant,
}

impl Execution {
    async fn run(self, claim: Option<Lease>) -> ExecuteResponse {
        let preview = &self.preview;
        let outcome = tokio::time::timeout(
            self.timeout,
            self.adapter
                .invoke(&preview.action_id, &preview.params, &self.credential, self.timeout),
        )
        .await
        .unwrap_or(Err(AdapterError::Timeout));

        let response = match outcome {
            Ok(outcome) => ExecuteResponse::succeeded(preview, outcome.result),
            Err(e) if e.may_have_committed() && self.idempotency_key.is_some() => {
                warn!(
                    preview_id = %preview.preview_id,
                    action = %preview.action_id,
                    failure = %e.failure(),
                    detail = %redact_detail(e.detail()),
                    "Downstream call unanswered, outcome unknown"
                );
                ExecuteResponse::unconfirmed(preview, e.failure())
            }
            Err(e) => {
                warn!(
                    preview_id = %preview.preview_id,
                    action = %preview.action_id,
                    failure = %e.failure(),
                    detail = %redact_detail(e.detail()),
                    "Downstream call failed"
                );
                ExecuteResponse::failed(preview, e.failure())
            }
        };

        let latency_ms = self.started.elapsed().as_millis() as u64;
        let labels = MetricLabels::new(&preview.provider, &preview.action_id, response.reason_label());
        self.metrics.increment(names::EXECUTION, &labels);
        self.metrics.observe_ms(names::EXECUTION_LATENCY_MS, &labels, latency_ms);
        info!(
            preview_id = %preview.preview_id,
            action = %preview.action_id,
            outcome = response.reason_label(),
            latency_ms,
            "Execution finished"
        );

        let (Some(key), Some(lease)) = (&self.idempotency_key, claim) else {
            return response;
        };
        if response.retryable {
            lease.release().await;
            return response;
        }

        let record = IdempotencyRecord {
            key: key.clone(),
            preview_id: preview.preview_id.clone(),
            digest: preview.digest.clone(),
            response: response.clone(),
            completed_at: Utc::now(),
        };
        match self.records.put_idempotency(&record).await {
            Ok(()) => lease.release().await,
            Err(e) => {
                // Keeping the claim blocks duplicates until it lapses
                error!(
                    preview_id = %preview.preview_id,
                    error = %e,
                    "Failed to persist idempotency record"
                );
                lease.abandon();
            }
        }
        response
    }
}

#[cfg(test)]
mod tests;
