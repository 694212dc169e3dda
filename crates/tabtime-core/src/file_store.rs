//! File-backed key/value store — one JSON file per scope.
//! Human-readable, survives restarts, rewritten whole on every change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::traits::KeyValueStore;
use crate::types::StoreChange;

/// JSON-file store for a single scope (`sync.json` or `local.json`).
///
/// Reads are served from memory and writes update memory before touching
/// disk, so a read that follows a write always observes it. A write whose
/// flush fails is rolled back. Edits made to the file by other processes
/// are picked up by [`FileStore::refresh`].
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, Value>>,
    disk: Mutex<DiskState>,
    flush: tokio::sync::Mutex<()>,
    changes: broadcast::Sender<StoreChange>,
}

/// What the file held the last time we read or wrote it.
struct DiskState {
    modified: Option<SystemTime>,
    values: HashMap<String, Value>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn parse_scope(path: &Path, json: &str) -> Option<HashMap<String, Value>> {
    match serde_json::from_str(json) {
        Ok(values) => Some(values),
        Err(e) => {
            tracing::warn!("⚠️ Failed to parse {}: {e}", path.display());
            None
        }
    }
}

/// Keys whose value differs between two snapshots.
fn changed_keys(old: &HashMap<String, Value>, new: &HashMap<String, Value>) -> Vec<String> {
    let mut keys: Vec<String> = old
        .keys()
        .chain(new.keys())
        .filter(|k| old.get(*k) != new.get(*k))
        .cloned()
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

impl FileStore {
    /// Open `<dir>/<scope>.json`, creating the directory if needed.
    pub fn open(dir: &Path, scope: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{scope}.json"));
        let cache = if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            parse_scope(&path, &json).unwrap_or_default()
        } else {
            HashMap::new()
        };
        let (changes, _) = broadcast::channel(256);
        Ok(Self {
            disk: Mutex::new(DiskState {
                modified: modified_at(&path),
                values: cache.clone(),
            }),
            path,
            cache: Mutex::new(cache),
            flush: tokio::sync::Mutex::new(()),
            changes,
        })
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        lock(&self.cache)
    }

    async fn persist(&self) -> Result<()> {
        let _flush = self.flush.lock().await;
        // Snapshot under the flush lock so the last writer always writes the newest state.
        let snapshot = self.cache().clone();
        let json = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&self.path, json).await?;
        *lock(&self.disk) = DiskState {
            modified: modified_at(&self.path),
            values: snapshot,
        };
        tracing::debug!("💾 Saved store to {}", self.path.display());
        Ok(())
    }

    /// Apply `mutate` to the cache, flush, and undo the change if the flush fails.
    async fn write<F>(&self, keys: Vec<String>, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<String, Value>),
    {
        let previous: Vec<(String, Option<Value>)> = {
            let mut cache = self.cache();
            let previous = keys.iter().map(|k| (k.clone(), cache.get(k).cloned())).collect();
            mutate(&mut *cache);
            previous
        };

        if let Err(e) = self.persist().await {
            let mut cache = self.cache();
            for (key, value) in previous {
                match value {
                    Some(value) => cache.insert(key, value),
                    None => cache.remove(&key),
                };
            }
            tracing::error!("❌ Failed to save {}: {e}", self.path.display());
            return Err(e);
        }

        let _ = self.changes.send(StoreChange { keys });
        Ok(())
    }

    /// Reload the file if another process changed it since we last read or
    /// wrote it, and announce the keys whose values differ. Returns them.
    ///
    /// Only keys changed on disk are applied, so an in-flight local write to
    /// another key is kept.
    pub async fn refresh(&self) -> Result<Vec<String>> {
        let _flush = self.flush.lock().await;
        let current = modified_at(&self.path);
        if current.is_none() || current == lock(&self.disk).modified {
            return Ok(Vec::new());
        }

        let json = tokio::fs::read_to_string(&self.path).await?;
        // A half-written file is retried once its mtime moves again.
        let Some(fresh) = parse_scope(&self.path, &json) else {
            lock(&self.disk).modified = current;
            return Ok(Vec::new());
        };

        let keys = {
            let mut disk = lock(&self.disk);
            let keys = changed_keys(&disk.values, &fresh);
            let mut cache = self.cache();
            for key in &keys {
                match fresh.get(key) {
                    Some(value) => cache.insert(key.clone(), value.clone()),
                    None => cache.remove(key),
                };
            }
            *disk = DiskState {
                modified: current,
                values: fresh,
            };
            keys
        };
        if !keys.is_empty() {
            tracing::info!("🔄 {} changed on disk: {}", self.path.display(), keys.join(", "));
            let _ = self.changes.send(StoreChange { keys: keys.clone() });
        }
        Ok(keys)
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>> {
        let cache = self.cache();
        Ok(keys
            .iter()
            .filter_map(|k| cache.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<()> {
        let keys: Vec<String> = items.keys().cloned().collect();
        self.write(keys, |cache| cache.extend(items)).await
    }

    async fn remove(&self, keys: &[&str]) -> Result<()> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.write(keys.clone(), |cache| {
            for key in &keys {
                cache.remove(key);
            }
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = std::env::temp_dir().join("tabtime-test-file-store");
        std::fs::remove_dir_all(&dir).ok();

        let store = FileStore::open(&dir, "local").unwrap();
        let mut items = HashMap::new();
        items.insert("tabsToClose".to_string(), serde_json::json!([{"tabId": 1}]));
        items.insert("tabsToCloseLock".to_string(), serde_json::json!({"owner": "w"}));
        store.set(items).await.unwrap();
        store.remove(&["tabsToCloseLock"]).await.unwrap();
        drop(store);

        let reopened = FileStore::open(&dir, "local").unwrap();
        let values = reopened.get(&["tabsToClose", "tabsToCloseLock"]).await.unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["tabsToClose"][0]["tabId"], 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = std::env::temp_dir().join("tabtime-test-file-store-corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("sync.json"), "{not json").unwrap();

        let store = FileStore::open(&dir, "sync").unwrap();
        assert!(store.get(&["schedules"]).await.unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_failed_flush_rolls_back() {
        let dir = std::env::temp_dir().join("tabtime-test-file-store-rollback");
        std::fs::remove_dir_all(&dir).ok();

        let store = FileStore::open(&dir, "local").unwrap();
        let mut items = HashMap::new();
        items.insert("tabsToClose".to_string(), serde_json::json!([]));
        store.set(items).await.unwrap();

        // A directory in place of the file makes every flush fail.
        std::fs::remove_file(dir.join("local.json")).unwrap();
        std::fs::create_dir(dir.join("local.json")).unwrap();
        let mut changes = store.subscribe();

        let mut items = HashMap::new();
        items.insert("tabsToClose".to_string(), serde_json::json!([{"tabId": 1}]));
        items.insert("tabsToCloseLock".to_string(), serde_json::json!({"owner": "w"}));
        assert!(store.set(items).await.is_err());
        assert!(store.remove(&["tabsToClose"]).await.is_err());

        let values = store.get(&["tabsToClose", "tabsToCloseLock"]).await.unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["tabsToClose"], serde_json::json!([]));
        assert!(changes.try_recv().is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_refresh_picks_up_external_edit() {
        let dir = std::env::temp_dir().join("tabtime-test-file-store-refresh");
        std::fs::remove_dir_all(&dir).ok();

        let store = FileStore::open(&dir, "sync").unwrap();
        let mut items = HashMap::new();
        items.insert("theme".to_string(), serde_json::json!("dark"));
        store.set(items).await.unwrap();
        assert!(store.refresh().await.unwrap().is_empty());

        let mut changes = store.subscribe();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        std::fs::write(
            dir.join("sync.json"),
            r#"{"theme": "dark", "schedules": [{"url": "https://a.com", "time": "09:00"}]}"#,
        )
        .unwrap();

        assert_eq!(store.refresh().await.unwrap(), vec!["schedules".to_string()]);
        let values = store.get(&["schedules"]).await.unwrap();
        assert_eq!(values["schedules"][0]["time"], "09:00");
        assert_eq!(changes.try_recv().unwrap().keys, vec!["schedules".to_string()]);

        // Nothing new on disk, nothing to announce.
        assert!(store.refresh().await.unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_refresh_ignores_half_written_file() {
        let dir = std::env::temp_dir().join("tabtime-test-file-store-partial");
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("sync.json"), r#"{"theme": "dark"}"#).unwrap();

        let store = FileStore::open(&dir, "sync").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        std::fs::write(dir.join("sync.json"), r#"{"theme": "#).unwrap();

        assert!(store.refresh().await.unwrap().is_empty());
        assert_eq!(store.get(&["theme"]).await.unwrap()["theme"], "dark");
        std::fs::remove_dir_all(&dir).ok();
    }
}
