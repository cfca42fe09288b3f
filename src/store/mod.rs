//! Key-value store interface used by every component that persists state.
//!
//! The store is eventually consistent and offers no transactions; anything that
//! needs mutual exclusion goes through [`crate::lock::AdvisoryLock`].

pub mod file;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Abstract key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value. Expired entries read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, optionally expiring after `ttl`.
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List live keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Read and deserialize a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and write a JSON value.
pub async fn put_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)?;
    store.put(key, raw, ttl).await
}

/// A stored value with its optional expiry, shared by the bundled stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredEntry {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    pub fn new(value: String, ttl: Option<Duration>) -> Self {
        let expires_at = ttl
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|d| Utc::now() + d);
        Self { value, expires_at }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}

// ---------------------------------------------------------------------------
// Key layout
// ---------------------------------------------------------------------------

pub const AGENT_PREFIX: &str = "agent:";

pub fn agent_key(user_id: &str, site_id: &str) -> String {
    format!("{}{}:{}", AGENT_PREFIX, user_id, site_id)
}

/// Split `agent:{user}:{site}` back into (user, site). Site ids never contain ':'.
pub fn parse_agent_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(AGENT_PREFIX)?;
    let (user_id, site_id) = rest.rsplit_once(':')?;
    if user_id.is_empty() || site_id.is_empty() {
        return None;
    }
    Some((user_id, site_id))
}

pub fn session_key(user_id: &str, site_id: &str) -> String {
    format!("session:{}:{}", user_id, site_id)
}

pub fn backoff_key(user_id: &str, site_id: &str) -> String {
    format!("backoff:{}:{}", user_id, site_id)
}

pub fn login_halt_key(user_id: &str, site_id: &str) -> String {
    format!("login_halt:{}:{}", user_id, site_id)
}

pub fn history_key(user_id: &str) -> String {
    format!("history:{}", user_id)
}

/// Set by the operator to pause every agent.
pub const MAINTENANCE_KEY: &str = "system:maintenance";

/// Whether the operator has paused the whole system.
pub async fn maintenance_enabled(store: &dyn KvStore) -> Result<bool, StoreError> {
    Ok(store.get(MAINTENANCE_KEY).await?.is_some())
}

/// Turn the global maintenance flag on or off.
pub async fn set_maintenance(store: &dyn KvStore, enabled: bool) -> Result<(), StoreError> {
    if enabled {
        store.put(MAINTENANCE_KEY, "1".to_string(), None).await
    } else {
        store.delete(MAINTENANCE_KEY).await
    }
}
