use super::*;
use crate::config::{RateLimitConfig, RefreshConfig};
use crate::credentials::{ActorType, Codec, CredentialStore, DurableStore};
use crate::kv::MemoryKv;
use crate::metrics::MetricsRecorder;
use crate::oauth::TokenGrant;
use crate::refresh::{RefreshError, TokenRefresher};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Clone, Copy)]
enum Step {
    Succeed,
    Status(u16),
    Hang,
}

/// Adapter that plays back a script of outcomes, then succeeds.
struct ScriptedAdapter {
    calls: AtomicUsize,
    delay: Duration,
    script: Mutex<VecDeque<Step>>,
    tokens_seen: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    fn new(delay: Duration, script: &[Step]) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            script: Mutex::new(script.iter().copied().collect()),
            tokens_seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DownstreamAdapter for ScriptedAdapter {
    fn provider(&self) -> &str {
        "gmail"
    }

    async fn invoke(
        &self,
        _action_id: &str,
        params: &serde_json::Value,
        credential: &Credential,
        _timeout: Duration,
    ) -> Result<Outcome, AdapterError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.tokens_seen
            .lock()
            .unwrap()
            .push(credential.access_token.clone());
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Succeed);

        tokio::time::sleep(self.delay).await;
        match step {
            Step::Succeed => Ok(Outcome {
                result: json!({"message_id": format!("m-{}", n), "to": params["to"]}),
            }),
            Step::Status(status) => Err(AdapterError::from_status(status, "Bearer leaked-token rejected")),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(AdapterError::Timeout)
            }
        }
    }
}

struct NoRefresh;

#[async_trait]
impl TokenRefresher for NoRefresh {
    async fn refresh(&self, _credential: &Credential) -> Result<TokenGrant, RefreshError> {
        Err(RefreshError::transient("not expected in these tests"))
    }
}

/// Provider whose token endpoint answers after `delay`.
struct SlowRefresher {
    calls: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl TokenRefresher for SlowRefresher {
    async fn refresh(&self, _credential: &Credential) -> Result<TokenGrant, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(TokenGrant {
            access_token: "gmail-token-2".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
            scope: None,
            token_type: Some("Bearer".to_string()),
        })
    }
}

fn send_mail() -> ActionSpec {
    ActionSpec::new("gmail.send", "gmail")
        .required(&["to", "subject"])
        .optional(&["body"])
        .digest_fields(&["to", "subject", "body"])
        .summary("Send '{subject}' to {to}")
}

fn actor() -> Actor {
    Actor::new("ws1", ActorType::User, "u1")
}

fn params() -> serde_json::Value {
    json!({"to": "a@example.com", "subject": "Hi", "body": "Hello"})
}

struct Fixture {
    gateway: Arc<ExecutionGateway>,
    adapter: Arc<ScriptedAdapter>,
    store: Arc<CredentialStore>,
    kv: Arc<MemoryKv>,
    metrics: Arc<MetricsRecorder>,
}

impl Fixture {
    async fn authorize(&self) {
        self.store
            .store(&Credential {
                identity: actor().identity_for("gmail"),
                access_token: "gmail-token".to_string(),
                refresh_token: None,
                expires_at: Utc::now() + chrono::Duration::hours(1),
                scope: Default::default(),
            })
            .await
            .unwrap();
    }

    /// A refreshable credential inside the safety margin.
    async fn authorize_expiring(&self) {
        self.store
            .store(&Credential {
                identity: actor().identity_for("gmail"),
                access_token: "gmail-token".to_string(),
                refresh_token: Some("gmail-refresh".to_string()),
                expires_at: Utc::now() + chrono::Duration::seconds(30),
                scope: Default::default(),
            })
            .await
            .unwrap();
    }

    async fn preview_id(&self) -> String {
        self.gateway
            .preview(&actor(), "gmail.send", params())
            .await
            .unwrap()
            .preview_id
    }
}

async fn fixture(adapter: Arc<ScriptedAdapter>) -> Fixture {
    fixture_with(adapter, RateLimitConfig::default(), GatewayConfig::default()).await
}

async fn fixture_with(
    adapter: Arc<ScriptedAdapter>,
    rate_limit: RateLimitConfig,
    config: GatewayConfig,
) -> Fixture {
    fixture_with_refresher(adapter, rate_limit, config, Arc::new(NoRefresh)).await
}

async fn fixture_with_refresher(
    adapter: Arc<ScriptedAdapter>,
    rate_limit: RateLimitConfig,
    config: GatewayConfig,
    refresher: Arc<dyn TokenRefresher>,
) -> Fixture {
    let kv = Arc::new(MemoryKv::new());
    let metrics = Arc::new(MetricsRecorder::new());
    let store = Arc::new(CredentialStore::new(
        DurableStore::open(":memory:").unwrap(),
        Codec::ephemeral(),
        None,
    ));
    let refresh = Arc::new(RefreshCoordinator::new(
        Arc::clone(&store),
        Some(kv.clone()),
        refresher,
        RefreshConfig::default(),
        metrics.clone(),
    ));
    let limiter = Arc::new(RateLimiter::new(&rate_limit, Some(kv.clone()), metrics.clone()).await);
    let records = RecordStore::new(kv.clone(), config.preview_ttl(), config.idempotency_ttl());

    let gateway = ExecutionGateway::new(
        ActionRegistry::new().with(send_mail()),
        records,
        limiter,
        refresh,
        config,
        metrics.clone(),
    )
    .with_adapter(adapter.clone());

    Fixture {
        gateway: Arc::new(gateway),
        adapter,
        store,
        kv,
        metrics,
    }
}

#[tokio::test]
async fn test_preview_describes_action() {
    let fx = fixture(ScriptedAdapter::new(Duration::ZERO, &[])).await;
    fx.authorize().await;

    let preview = fx.gateway.preview(&actor(), "gmail.send", params()).await.unwrap();

    assert_eq!(preview.summary, "Send 'Hi' to a@example.com");
    assert_eq!(preview.digest, send_mail().digest(&params()));
    assert!(preview.warnings.is_empty());
    assert!(preview.expires_at > Utc::now());
    assert_eq!(fx.adapter.calls(), 0);
    assert_eq!(fx.kv.keys_with_prefix("preview:").len(), 1);
}

#[tokio::test]
async fn test_preview_warns_when_unauthorized() {
    let fx = fixture(ScriptedAdapter::new(Duration::ZERO, &[])).await;

    let preview = fx.gateway.preview(&actor(), "gmail.send", params()).await.unwrap();
    assert_eq!(preview.warnings.len(), 1);
    assert!(preview.warnings[0].contains("authorization required"));
}

#[tokio::test]
async fn test_preview_missing_subject_stores_nothing() {
    let fx = fixture(ScriptedAdapter::new(Duration::ZERO, &[])).await;

    let err = fx
        .gateway
        .preview(&actor(), "gmail.send", json!({"to": "a@example.com"}))
        .await
        .unwrap_err();

    assert_eq!(err.reason(), ErrorReason::ValidationError);
    assert!(err.to_string().contains("subject"));
    assert!(fx.kv.keys_with_prefix("preview:").is_empty());
    assert_eq!(fx.metrics.count(names::PREVIEW, "validation_error"), 1);
}

#[tokio::test]
async fn test_preview_unknown_action() {
    let fx = fixture(ScriptedAdapter::new(Duration::ZERO, &[])).await;

    let err = fx
        .gateway
        .preview(&actor(), "gmail.delete_everything", params())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GateError::Validation(ValidationError::UnknownAction(_))
    ));
}

#[tokio::test]
async fn test_execute_runs_with_stored_credential() {
    let fx = fixture(ScriptedAdapter::new(Duration::ZERO, &[])).await;
    fx.authorize().await;
    let preview_id = fx.preview_id().await;

    let response = fx.gateway.execute(&preview_id, None).await.unwrap();

    assert_eq!(response.status, ExecutionStatus::Succeeded);
    assert_eq!(response.action_id, "gmail.send");
    assert_eq!(response.result.as_ref().unwrap()["to"], "a@example.com");
    assert_eq!(*fx.adapter.tokens_seen.lock().unwrap(), vec!["gmail-token".to_string()]);
    assert_eq!(fx.metrics.count(names::EXECUTION, "success"), 1);
    assert_eq!(fx.metrics.histogram(names::EXECUTION_LATENCY_MS).0, 1);
}

#[tokio::test]
async fn test_unknown_preview_is_not_rate_limited() {
    let fx = fixture(ScriptedAdapter::new(Duration::ZERO, &[])).await;
    fx.authorize().await;

    let err = fx.gateway.execute("no-such-preview", Some("k1")).await.unwrap_err();

    assert!(matches!(err, GateError::PreviewNotFound { .. }));
    assert!(fx.kv.keys_with_prefix("rl:").is_empty());
    assert!(fx.kv.keys_with_prefix("idem").is_empty());
    assert_eq!(fx.adapter.calls(), 0);
}

#[tokio::test]
async fn test_concurrent_duplicates_call_downstream_once() {
    let fx = fixture(ScriptedAdapter::new(Duration::from_millis(100), &[])).await;
    fx.authorize().await;
    let preview_id = fx.preview_id().await;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let gateway = Arc::clone(&fx.gateway);
        let preview_id = preview_id.clone();
        handles.push(tokio::spawn(async move {
            gateway.execute(&preview_id, Some("send-once")).await
        }));
    }

    let first = handles.remove(0).await.unwrap().unwrap();
    let second = handles.remove(0).await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.status, ExecutionStatus::Succeeded);
    assert_eq!(fx.adapter.calls(), 1);
    assert!(fx.kv.keys_with_prefix("idem-claim:").is_empty());
}

#[tokio::test]
async fn test_retry_after_success_replays_record() {
    let fx = fixture(ScriptedAdapter::new(Duration::ZERO, &[])).await;
    fx.authorize().await;
    let preview_id = fx.preview_id().await;

    let first = fx.gateway.execute(&preview_id, Some("k1")).await.unwrap();
    let again = fx.gateway.execute(&preview_id, Some("k1")).await.unwrap();

    assert_eq!(first, again);
    assert_eq!(fx.adapter.calls(), 1);
    assert_eq!(fx.metrics.count(names::EXECUTION, "replayed"), 1);
}

#[tokio::test]
async fn test_idempotency_key_bound_to_preview() {
    let fx = fixture(ScriptedAdapter::new(Duration::ZERO, &[])).await;
    fx.authorize().await;
    let first = fx.preview_id().await;
    let second = fx.preview_id().await;

    fx.gateway.execute(&first, Some("k1")).await.unwrap();
    let err = fx.gateway.execute(&second, Some("k1")).await.unwrap_err();

    assert!(matches!(
        err,
        GateError::Validation(ValidationError::IdempotencyKeyReused)
    ));
    assert_eq!(fx.adapter.calls(), 1);
}

#[tokio::test]
async fn test_without_key_every_execute_runs() {
    let fx = fixture(ScriptedAdapter::new(Duration::ZERO, &[])).await;
    fx.authorize().await;
    let preview_id = fx.preview_id().await;

    fx.gateway.execute(&preview_id, None).await.unwrap();
    fx.gateway.execute(&preview_id, None).await.unwrap();
    assert_eq!(fx.adapter.calls(), 2);
}

#[tokio::test]
async fn test_server_error_is_not_recorded() {
    let fx = fixture(ScriptedAdapter::new(Duration::ZERO, &[Step::Status(503)])).await;
    fx.authorize().await;
    let preview_id = fx.preview_id().await;

    let failed = fx.gateway.execute(&preview_id, Some("k1")).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.reason, Some(ErrorReason::DownstreamServerError));
    assert!(failed.retryable);
    assert!(fx.kv.keys_with_prefix("idem:").is_empty());

    let retried = fx.gateway.execute(&preview_id, Some("k1")).await.unwrap();
    assert_eq!(retried.status, ExecutionStatus::Succeeded);
    assert_eq!(fx.adapter.calls(), 2);
}

#[tokio::test]
async fn test_client_error_is_recorded() {
    let fx = fixture(ScriptedAdapter::new(Duration::ZERO, &[Step::Status(422)])).await;
    fx.authorize().await;
    let preview_id = fx.preview_id().await;

    let rejected = fx.gateway.execute(&preview_id, Some("k1")).await.unwrap();
    assert_eq!(rejected.reason, Some(ErrorReason::DownstreamClientError));
    assert!(!rejected.retryable);

    let replayed = fx.gateway.execute(&preview_id, Some("k1")).await.unwrap();
    assert_eq!(rejected, replayed);
    assert_eq!(fx.adapter.calls(), 1);
}

#[tokio::test]
async fn test_hung_adapter_times_out() {
    let config = GatewayConfig {
        adapter_timeout_secs: 1,
        ..GatewayConfig::default()
    };
    let fx = fixture_with(
        ScriptedAdapter::new(Duration::ZERO, &[Step::Hang]),
        RateLimitConfig::default(),
        config,
    )
    .await;
    fx.authorize().await;
    let preview_id = fx.preview_id().await;

    let response = fx.gateway.execute(&preview_id, Some("k1")).await.unwrap();
    assert_eq!(response.reason, Some(ErrorReason::DownstreamTimeout));
    assert!(fx.kv.keys_with_prefix("idem-claim:").is_empty());

    // The provider may have acted: the key replays instead of sending again
    assert!(!response.retryable);
    let replayed = fx.gateway.execute(&preview_id, Some("k1")).await.unwrap();
    assert_eq!(response, replayed);
    assert_eq!(fx.adapter.calls(), 1);
}

#[tokio::test]
async fn test_timeout_without_key_stays_retryable() {
    let config = GatewayConfig {
        adapter_timeout_secs: 1,
        ..GatewayConfig::default()
    };
    let fx = fixture_with(
        ScriptedAdapter::new(Duration::ZERO, &[Step::Hang]),
        RateLimitConfig::default(),
        config,
    )
    .await;
    fx.authorize().await;
    let preview_id = fx.preview_id().await;

    let response = fx.gateway.execute(&preview_id, None).await.unwrap();
    assert_eq!(response.reason, Some(ErrorReason::DownstreamTimeout));
    assert!(response.retryable);
    assert!(fx.kv.keys_with_prefix("idem:").is_empty());
}

#[tokio::test]
async fn test_dropped_caller_still_records_outcome() {
    let fx = fixture(ScriptedAdapter::new(Duration::from_millis(300), &[])).await;
    fx.authorize().await;
    let preview_id = fx.preview_id().await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        fx.gateway.execute(&preview_id, Some("k1")),
    )
    .await;
    assert!(abandoned.is_err());

    // The spawned call finishes on its own and writes the record
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fx.kv.keys_with_prefix("idem:").len(), 1);

    let retried = fx.gateway.execute(&preview_id, Some("k1")).await.unwrap();
    assert_eq!(retried.status, ExecutionStatus::Succeeded);
    assert_eq!(retried.result.as_ref().unwrap()["message_id"], "m-1");
    assert_eq!(fx.adapter.calls(), 1);
    assert_eq!(fx.metrics.count(names::EXECUTION, "replayed"), 1);
}

#[tokio::test]
async fn test_claim_outlives_slow_refresh() {
    // Refresh alone takes longer than the adapter timeout plus slack
    let config = GatewayConfig {
        adapter_timeout_secs: 1,
        ..GatewayConfig::default()
    };
    let refresher = Arc::new(SlowRefresher {
        calls: AtomicUsize::new(0),
        delay: Duration::from_millis(6300),
    });
    let fx = fixture_with_refresher(
        ScriptedAdapter::new(Duration::ZERO, &[]),
        RateLimitConfig::default(),
        config,
        refresher.clone(),
    )
    .await;
    fx.authorize_expiring().await;
    let preview_id = fx.preview_id().await;

    let first = {
        let gateway = Arc::clone(&fx.gateway);
        let preview_id = preview_id.clone();
        tokio::spawn(async move { gateway.execute(&preview_id, Some("K")).await })
    };
    tokio::time::sleep(Duration::from_millis(6100)).await;
    let second = fx.gateway.execute(&preview_id, Some("K")).await.unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(first.status, ExecutionStatus::Succeeded);
    assert_eq!(fx.adapter.calls(), 1);
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        *fx.adapter.tokens_seen.lock().unwrap(),
        vec!["gmail-token-2".to_string()]
    );
}

#[tokio::test]
async fn test_missing_credential_requires_authorization() {
    let fx = fixture(ScriptedAdapter::new(Duration::ZERO, &[])).await;
    let preview_id = fx.preview_id().await;

    let err = fx.gateway.execute(&preview_id, Some("k1")).await.unwrap_err();

    assert!(matches!(err, GateError::AuthRequired { ref provider } if provider == "gmail"));
    assert!(!err.is_retryable());
    assert_eq!(fx.adapter.calls(), 0);
    assert!(fx.kv.keys_with_prefix("idem-claim:").is_empty());
    assert_eq!(fx.metrics.count(names::EXECUTION, "auth_required"), 1);
}

#[tokio::test]
async fn test_rate_limited_before_downstream() {
    let rate_limit = RateLimitConfig {
        limit_per_window: 1,
        ..RateLimitConfig::default()
    };
    let fx = fixture_with(
        ScriptedAdapter::new(Duration::ZERO, &[]),
        rate_limit,
        GatewayConfig::default(),
    )
    .await;
    fx.authorize().await;
    let preview_id = fx.preview_id().await;

    fx.gateway.execute(&preview_id, None).await.unwrap();
    let err = fx.gateway.execute(&preview_id, None).await.unwrap_err();

    assert!(matches!(err, GateError::RateLimited { ref client_key } if client_key == "ws1:gmail"));
    assert!(err.is_retryable());
    assert_eq!(fx.adapter.calls(), 1);
}

#[test]
fn test_authorization_mapping() {
    let identity = actor().identity_for("gmail");
    let dead = GateError::RefreshFailed {
        identity: identity.clone(),
        kind: RefreshFailure::InvalidGrant,
    };
    let flaky = GateError::RefreshFailed {
        identity,
        kind: RefreshFailure::Transient,
    };

    assert!(matches!(
        require_authorization(dead, "gmail"),
        GateError::AuthRequired { .. }
    ));
    assert!(matches!(
        require_authorization(flaky, "gmail"),
        GateError::RefreshFailed { .. }
    ));
}
