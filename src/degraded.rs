//! Explicit degraded-mode flag.
//!
//! The rate limiter and the credential cache each own one. It flips on the
//! first backend failure, stays on until the next successful backend call,
//! and records when it started so callers can bound how long they fail open.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::{info, warn};

/// Sentinel for "not degraded".
const HEALTHY: i64 = 0;

#[derive(Debug)]
pub struct DegradedMode {
    component: &'static str,
    since_ms: AtomicI64,
    failures: AtomicU64,
}

impl DegradedMode {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            since_ms: AtomicI64::new(HEALTHY),
            failures: AtomicU64::new(0),
        }
    }

    /// Records a backend failure. Logs only on the healthy → degraded edge.
    pub fn enter(&self, cause: &str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis().max(1);
        if self
            .since_ms
            .compare_exchange(HEALTHY, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            warn!(component = self.component, cause = %cause, "Entering degraded mode");
        }
    }

    /// Records a successful backend call.
    pub fn clear(&self) {
        let since = self.since_ms.swap(HEALTHY, Ordering::AcqRel);
        if since != HEALTHY {
            info!(
                component = self.component,
                degraded_ms = Utc::now().timestamp_millis() - since,
                "Leaving degraded mode"
            );
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.since_ms.load(Ordering::Acquire) != HEALTHY
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        match self.since_ms.load(Ordering::Acquire) {
            HEALTHY => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// How long the current degraded episode has lasted.
    pub fn duration(&self) -> Option<Duration> {
        self.since().map(|since| Utc::now() - since)
    }

    /// Backend failures observed over the lifetime of this flag.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn component(&self) -> &'static str {
        self.component
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_healthy() {
        let flag = DegradedMode::new("test");
        assert!(!flag.is_degraded());
        assert!(flag.since().is_none());
        assert!(flag.duration().is_none());
    }

    #[test]
    fn test_enter_and_clear() {
        let flag = DegradedMode::new("test");

        flag.enter("connection refused");
        assert!(flag.is_degraded());
        let first_since = flag.since().unwrap();

        // Repeated failures keep the original start time
        flag.enter("connection refused");
        assert_eq!(flag.since().unwrap(), first_since);
        assert_eq!(flag.failure_count(), 2);

        flag.clear();
        assert!(!flag.is_degraded());
        assert_eq!(flag.failure_count(), 2);
    }
}
