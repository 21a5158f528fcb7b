// Distributed fixed-window counter.
//
// Every worker increments the same `rl:<client_key>:<window_id>` key, so the
// limit holds across processes. The key expires with its window.

use crate::kv::{key_part, DistributedCache, KvError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

pub struct FixedWindowLimiter {
    kv: Arc<dyn DistributedCache>,
    limit: u64,
    window: Duration,
}

impl FixedWindowLimiter {
    pub fn new(kv: Arc<dyn DistributedCache>, limit: u64, window: Duration) -> Self {
        Self {
            kv,
            limit,
            window: window.max(Duration::from_secs(1)),
        }
    }

    /// Counts this request against the current window.
    pub async fn allow(&self, client_key: &str) -> Result<bool, KvError> {
        self.allow_at(client_key, Utc::now().timestamp().max(0) as u64)
            .await
    }

    pub(crate) async fn allow_at(&self, client_key: &str, unix_secs: u64) -> Result<bool, KvError> {
        let key = self.window_key(client_key, unix_secs);
        let count = self.kv.incr(&key, self.window).await?;
        Ok(count <= self.limit)
    }

    pub(crate) fn window_key(&self, client_key: &str, unix_secs: u64) -> String {
        let window_id = unix_secs / self.window.as_secs();
        format!("rl:{}:{}", key_part(client_key), window_id)
    }
}
