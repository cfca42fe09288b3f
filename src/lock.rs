//! Best-effort advisory lock on top of the key-value store.
//!
//! The store has no compare-and-swap, so acquisition is write-then-confirm:
//! write a unique token when the key is empty, wait a short settle period, and
//! read the key back. Two writers that both observe an empty key within the
//! settle window resolve to whoever wrote last; a writer that arrives after the
//! other's confirmation read can still overwrite it. That window is small but
//! real, so callers must treat the lock as deduplication, not as a mutex, and
//! re-check their own preconditions after acquiring it.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::KvStore;

/// Default lifetime of a held lock; a crashed holder frees it after this.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Pause between writing the token and reading it back.
const CONFIRM_DELAY: Duration = Duration::from_millis(25);

/// One participant's handle on a named lock.
pub struct AdvisoryLock {
    store: Arc<dyn KvStore>,
    key: String,
    token: String,
    ttl: Duration,
}

impl AdvisoryLock {
    /// Create a handle for lock `name` (stored under `lock:{name}`).
    pub fn new(store: Arc<dyn KvStore>, name: &str) -> Self {
        Self {
            store,
            key: format!("lock:{}", name),
            token: Uuid::new_v4().to_string(),
            ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Try to take the lock, retrying up to `retries` more times.
    ///
    /// Returns `false` when every attempt found the lock held by someone else.
    pub async fn acquire(&self, retries: u32, retry_delay: Duration) -> Result<bool, StoreError> {
        for attempt in 0..=retries {
            if self.try_acquire().await? {
                debug!("Lock: acquired {} (attempt {})", self.key, attempt + 1);
                return Ok(true);
            }
            if attempt < retries {
                tokio::time::sleep(retry_delay + jitter(retry_delay)).await;
            }
        }
        warn!("Lock: gave up on {} after {} attempts", self.key, retries + 1);
        Ok(false)
    }

    async fn try_acquire(&self) -> Result<bool, StoreError> {
        if self.store.get(&self.key).await?.is_some() {
            return Ok(false);
        }
        self.store
            .put(&self.key, self.token.clone(), Some(self.ttl))
            .await?;
        tokio::time::sleep(CONFIRM_DELAY).await;
        Ok(self.store.get(&self.key).await?.as_deref() == Some(self.token.as_str()))
    }

    /// Release the lock if this handle still owns it.
    pub async fn release(&self) -> Result<(), StoreError> {
        match self.store.get(&self.key).await? {
            Some(current) if current == self.token => {
                self.store.delete(&self.key).await?;
                debug!("Lock: released {}", self.key);
            }
            Some(_) => debug!("Lock: {} now held by another owner, leaving it", self.key),
            None => {}
        }
        Ok(())
    }
}

/// Up to half the delay again, so waiting participants spread out.
fn jitter(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.0..0.5))
}
