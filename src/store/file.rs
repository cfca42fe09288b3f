//! JSON-file store used by the CLI.
//!
//! Every operation re-reads the file so separate CLI invocations observe each
//! other's writes. Good enough for a single host; not a shared database.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{KvStore, StoredEntry};
use crate::error::StoreError;

type Entries = BTreeMap<String, StoredEntry>;

/// Store persisted to a single JSON file.
pub struct FileStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileStore {
    /// Create a store at the given file path. The file is created on first write.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            guard: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Entries, StoreError> {
        if !self.path.exists() {
            return Ok(Entries::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(Entries::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn persist(&self, entries: &Entries) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Load, drop expired entries, apply `f`, and write back if anything changed.
    async fn update<R>(&self, f: impl FnOnce(&mut Entries) -> R) -> Result<R, StoreError> {
        let _guard = self.guard.lock().await;
        let mut entries = self.load().await?;
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        let pruned = before != entries.len();
        let snapshot = entries.clone();
        let result = f(&mut entries);
        if pruned || !entries_equal(&snapshot, &entries) {
            debug!("FileStore: writing {} entries to {}", entries.len(), self.path.display());
            self.persist(&entries).await?;
        }
        Ok(result)
    }
}

fn entries_equal(a: &Entries, b: &Entries) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|((ka, va), (kb, vb))| {
                ka == kb && va.value == vb.value && va.expires_at == vb.expires_at
            })
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.guard.lock().await;
        let entries = self.load().await?;
        let now = Utc::now();
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let entry = StoredEntry::new(value, ttl);
        self.update(|entries| {
            entries.insert(key.to_string(), entry);
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.update(|entries| {
            entries.remove(key);
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let _guard = self.guard.lock().await;
        let entries = self.load().await?;
        let now = Utc::now();
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = FileStore::new(path.clone());
        store.put("agent:u:s", "{\"a\":1}".to_string(), None).await.unwrap();
        store.put("other", "x".to_string(), None).await.unwrap();
        drop(store);

        let reopened = FileStore::new(path);
        assert_eq!(
            reopened.get("agent:u:s").await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );
        assert_eq!(reopened.list("agent:").await.unwrap(), vec!["agent:u:s".to_string()]);
    }

    #[tokio::test]
    async fn test_file_store_delete_and_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested").join("store.json"));

        store
            .put("temp", "v".to_string(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        store.put("keep", "v".to_string(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("temp").await.unwrap().is_none());

        store.delete("keep").await.unwrap();
        assert!(store.get("keep").await.unwrap().is_none());
    }
}
