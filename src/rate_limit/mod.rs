// Admission control for outbound provider calls.
//
// Distributed fixed-window counter when the shared backend answered at
// startup, in-process token bucket otherwise. Backend errors during a
// decision fail open and flip the limiter's DegradedMode; an outage longer
// than `max_fail_open_secs` falls back to the local bucket instead of
// blanket allow. Client keys are `<workspace_id>:<provider>`.

mod bucket;
mod window;

pub use bucket::TokenBucketLimiter;
pub use window::FixedWindowLimiter;

use crate::config::RateLimitConfig;
use crate::degraded::DegradedMode;
use crate::kv::DistributedCache;
use crate::metrics::{names, MetricLabels, MetricsSink};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Limiting switched off in config; every request passes.
    Disabled,
    Local,
    Distributed,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Disabled => "disabled",
            Strategy::Local => "local",
            Strategy::Distributed => "distributed",
        })
    }
}

/// Rate-limit key for one workspace's calls to one provider.
pub fn client_key(workspace_id: &str, provider: &str) -> String {
    format!("{}:{}", workspace_id, provider)
}

pub struct RateLimiter {
    enabled: bool,
    local: TokenBucketLimiter,
    distributed: Option<FixedWindowLimiter>,
    max_fail_open: Duration,
    degraded: DegradedMode,
    metrics: Arc<dyn MetricsSink>,
}

impl RateLimiter {
    /// Picks the distributed strategy when `kv` is given and answers a ping.
    pub async fn new(
        config: &RateLimitConfig,
        kv: Option<Arc<dyn DistributedCache>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let distributed = match kv {
            Some(kv) => match kv.ping().await {
                Ok(()) => Some(FixedWindowLimiter::new(
                    kv,
                    config.limit_per_window,
                    Duration::from_secs(config.window_secs),
                )),
                Err(e) => {
                    warn!(error = %e, "Rate limit backend unreachable at startup, using in-process buckets");
                    None
                }
            },
            None => None,
        };

        let limiter = Self {
            enabled: config.enabled,
            local: TokenBucketLimiter::new(config.bucket_capacity, config.refill_per_sec),
            distributed,
            max_fail_open: Duration::from_secs(config.max_fail_open_secs),
            degraded: DegradedMode::new("rate_limiter"),
            metrics,
        };
        info!(strategy = %limiter.strategy(), "Rate limiter ready");
        limiter
    }

    /// In-process buckets only.
    pub fn local(config: &RateLimitConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            enabled: config.enabled,
            local: TokenBucketLimiter::new(config.bucket_capacity, config.refill_per_sec),
            distributed: None,
            max_fail_open: Duration::from_secs(config.max_fail_open_secs),
            degraded: DegradedMode::new("rate_limiter"),
            metrics,
        }
    }

    pub fn strategy(&self) -> Strategy {
        match (self.enabled, &self.distributed) {
            (false, _) => Strategy::Disabled,
            (true, Some(_)) => Strategy::Distributed,
            (true, None) => Strategy::Local,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Admission decision for one request. Never errors.
    pub async fn allow(&self, client_key: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let Some(window) = &self.distributed else {
            return self.decide_local(client_key);
        };

        match window.allow(client_key).await {
            Ok(allowed) => {
                self.degraded.clear();
                self.record(if allowed { "allowed" } else { "denied" });
                allowed
            }
            Err(e) => {
                self.degraded.enter(&e.to_string());
                self.metrics
                    .increment(names::RATE_LIMIT_DEGRADED, &MetricLabels::reason("backend_error"));

                if self.within_fail_open_window() {
                    warn!(error = %e, "Rate limit backend error, failing open");
                    self.record("fail_open");
                    true
                } else {
                    self.decide_local(client_key)
                }
            }
        }
    }

    fn within_fail_open_window(&self) -> bool {
        match self.degraded.duration().and_then(|d| d.to_std().ok()) {
            Some(elapsed) => elapsed < self.max_fail_open,
            None => true,
        }
    }

    fn decide_local(&self, client_key: &str) -> bool {
        let allowed = self.local.allow(client_key);
        self.record(if allowed { "allowed" } else { "denied" });
        allowed
    }

    fn record(&self, reason: &'static str) {
        self.metrics
            .increment(names::RATE_LIMIT_DECISION, &MetricLabels::reason(reason));
    }

    pub fn degraded(&self) -> &DegradedMode {
        &self.degraded
    }

    /// Drops idle in-process buckets.
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        self.local.purge_idle(max_idle)
    }
}
