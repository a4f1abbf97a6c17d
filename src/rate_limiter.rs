//! Per-mailbox fixed-window call budget for the Gmail API
//!
//! Each mailbox gets a counter keyed by the current window index. The counter
//! is incremented before every provider call; once it passes the cap the call is
//! refused locally with `RateLimited` instead of reaching the provider. The
//! counter lives in the shared key-value store so concurrent invocations see
//! the same budget.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::{Result, TriageError};
use crate::store::KvStore;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(100);
pub const DEFAULT_MAX_CALLS: u32 = 250;

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    window: Duration,
    max_calls: u32,
}

impl RateLimiter {
    /// Create a limiter with Gmail's per-user budget (250 calls per 100 seconds)
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_config(store, DEFAULT_WINDOW, DEFAULT_MAX_CALLS)
    }

    pub fn with_config(store: Arc<dyn KvStore>, window: Duration, max_calls: u32) -> Self {
        Self {
            store,
            window,
            max_calls,
        }
    }

    pub fn max_calls(&self) -> u32 {
        self.max_calls
    }

    fn window_secs(&self) -> i64 {
        i64::try_from(self.window.as_secs().max(1)).unwrap_or(i64::MAX)
    }

    /// Counter key for the window containing `now`
    pub fn window_key(&self, mailbox: &str, now: DateTime<Utc>) -> String {
        let index = now.timestamp().div_euclid(self.window_secs());
        format!("ratelimit:{}:{}", mailbox, index)
    }

    /// Count one call against the mailbox budget
    pub async fn acquire(&self, mailbox: &str) -> Result<()> {
        self.acquire_at(mailbox, Utc::now()).await
    }

    pub async fn acquire_at(&self, mailbox: &str, now: DateTime<Utc>) -> Result<()> {
        let key = self.window_key(mailbox, now);
        let count = self.store.incr(&key).await?;

        if count == 1 {
            self.store.expire(&key, self.window).await?;
        }

        trace!("Rate window {}: {}/{}", key, count, self.max_calls);

        if count > i64::from(self.max_calls) {
            let window = self.window_secs();
            let retry_after = (window - now.timestamp().rem_euclid(window)).max(1) as u64;
            warn!(
                "Local rate limit reached for {} ({} calls), retry after {}s",
                mailbox, count, retry_after
            );
            return Err(TriageError::RateLimited { retry_after });
        }

        if count == i64::from(self.max_calls) {
            debug!("Last call of the current window for {}", mailbox);
        }
        Ok(())
    }

    /// Calls already counted in the current window
    pub async fn used(&self, mailbox: &str) -> Result<u32> {
        let key = self.window_key(mailbox, Utc::now());
        Ok(self
            .store
            .get(&key)
            .await?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0))
    }
}
