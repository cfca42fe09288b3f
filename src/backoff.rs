//! Exponential-with-jitter retry tracking, persisted per key.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::store::{self, KvStore};

/// Consecutive failures and when the next attempt is allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffState {
    pub failures: u32,
    pub next_allowed_retry: DateTime<Utc>,
    pub last_delay_ms: u64,
}

/// Result of [`BackoffTracker::check_can_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStatus {
    Ready,
    Wait(chrono::Duration),
}

/// Tracks failures under a key prefix in the shared store.
#[derive(Clone)]
pub struct BackoffTracker {
    store: Arc<dyn KvStore>,
}

impl BackoffTracker {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Record a failure and return the delay until the next allowed attempt.
    ///
    /// The delay doubles per consecutive failure from `base`, is capped at `max`,
    /// and carries ±10% jitter.
    pub async fn record_failure(
        &self,
        key: &str,
        base: Duration,
        max: Duration,
    ) -> Result<Duration, StoreError> {
        let previous: Option<BackoffState> = store::get_json(self.store.as_ref(), key).await?;
        let failures = previous.map_or(0, |s| s.failures).saturating_add(1);

        let delay = with_jitter(exponential_delay(failures, base, max));
        let state = BackoffState {
            failures,
            next_allowed_retry: Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
            last_delay_ms: delay.as_millis() as u64,
        };
        store::put_json(self.store.as_ref(), key, &state, Some(max * 2)).await?;
        debug!(
            "Backoff: {} failure #{} -> retry in {}ms",
            key, failures, state.last_delay_ms
        );
        Ok(delay)
    }

    /// Forget all failures for `key`.
    pub async fn record_success(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(key).await
    }

    pub async fn check_can_retry(&self, key: &str) -> Result<RetryStatus, StoreError> {
        let state: Option<BackoffState> = store::get_json(self.store.as_ref(), key).await?;
        let now = Utc::now();
        Ok(match state {
            Some(s) if now < s.next_allowed_retry => RetryStatus::Wait(s.next_allowed_retry - now),
            _ => RetryStatus::Ready,
        })
    }

    pub async fn state(&self, key: &str) -> Result<Option<BackoffState>, StoreError> {
        store::get_json(self.store.as_ref(), key).await
    }
}

/// `min(base * 2^(failures-1), max)` without jitter.
pub fn exponential_delay(failures: u32, base: Duration, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |d| d.min(max))
}

fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tracker() -> BackoffTracker {
        BackoffTracker::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_exponential_delay_caps() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(6 * 3600);
        assert_eq!(exponential_delay(1, base, max), Duration::from_secs(60));
        assert_eq!(exponential_delay(3, base, max), Duration::from_secs(240));
        assert_eq!(exponential_delay(20, base, max), max);
        assert_eq!(exponential_delay(u32::MAX, base, max), max);
    }

    #[tokio::test]
    async fn test_four_failures_double_with_jitter() {
        let tracker = tracker();
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(6 * 3600);

        for expected_secs in [60.0, 120.0, 240.0, 480.0] {
            let delay = tracker.record_failure("u:s", base, max).await.unwrap();
            let secs = delay.as_secs_f64();
            assert!(
                secs >= expected_secs * 0.9 - 0.001 && secs <= expected_secs * 1.1 + 0.001,
                "delay {} not within 10% of {}",
                secs,
                expected_secs
            );
        }
        assert_eq!(tracker.state("u:s").await.unwrap().unwrap().failures, 4);
        assert!(matches!(
            tracker.check_can_retry("u:s").await.unwrap(),
            RetryStatus::Wait(_)
        ));
    }

    #[tokio::test]
    async fn test_success_clears_record() {
        let tracker = tracker();
        tracker
            .record_failure("k", Duration::from_secs(60), Duration::from_secs(600))
            .await
            .unwrap();
        tracker.record_success("k").await.unwrap();
        assert!(tracker.state("k").await.unwrap().is_none());
        assert_eq!(tracker.check_can_retry("k").await.unwrap(), RetryStatus::Ready);
    }

    #[tokio::test]
    async fn test_unknown_key_is_ready() {
        assert_eq!(
            tracker().check_can_retry("never").await.unwrap(),
            RetryStatus::Ready
        );
    }
}
