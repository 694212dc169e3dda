//! Pending-close registry — the persisted list of tabs awaiting a close.
//!
//! This is the source of truth for close scheduling; alarms are only wake-up
//! triggers derived from it. Callers must hold `tabsToCloseLock` around any
//! load → modify → save sequence.

use std::sync::Arc;

use serde_json::Value;
use tabtime_core::error::Result;
use tabtime_core::traits::KeyValueStore;
use tabtime_core::traits::store::{get_value, set_json};
use tabtime_core::types::{AlarmKind, PendingCloseEntry, TABS_TO_CLOSE_KEY};

#[derive(Clone)]
pub struct PendingCloseRegistry {
    store: Arc<dyn KeyValueStore>,
}

impl PendingCloseRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Current entries. Malformed entries are skipped.
    pub async fn load(&self) -> Result<Vec<PendingCloseEntry>> {
        let Some(value) = get_value(self.store.as_ref(), TABS_TO_CLOSE_KEY).await? else {
            return Ok(Vec::new());
        };
        let Value::Array(items) = value else {
            tracing::warn!("⚠️ '{}' is not a list, treating as empty", TABS_TO_CLOSE_KEY);
            return Ok(Vec::new());
        };
        Ok(items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("⚠️ Dropping malformed pending-close entry: {e}");
                    None
                }
            })
            .collect())
    }

    pub async fn save(&self, entries: &[PendingCloseEntry]) -> Result<()> {
        set_json(self.store.as_ref(), TABS_TO_CLOSE_KEY, &entries).await?;
        tracing::debug!("💾 Saved {} pending-close entries", entries.len());
        Ok(())
    }

    /// Write an empty list if none exists yet.
    pub async fn ensure_initialized(&self) -> Result<()> {
        if get_value(self.store.as_ref(), TABS_TO_CLOSE_KEY).await?.is_none() {
            self.save(&[]).await?;
        }
        Ok(())
    }
}

/// Build a new entry whose alarm name is unique within `existing`.
pub fn new_entry(existing: &[PendingCloseEntry], tab_id: i64, close_time: i64, now_ms: i64) -> PendingCloseEntry {
    let mut created_at = now_ms;
    loop {
        let kind = AlarmKind::CloseFire { tab_id, created_at };
        let alarm_name = kind.alarm_name().unwrap_or_default();
        if !existing.iter().any(|e| e.alarm_name == alarm_name) {
            return PendingCloseEntry {
                tab_id,
                close_time,
                alarm_name,
                created_at,
            };
        }
        created_at += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabtime_core::memory::MemoryStore;
    use tabtime_core::traits::store::set_value;

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let registry = PendingCloseRegistry::new(Arc::new(MemoryStore::new()));
        assert!(registry.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_initialized_only_once() {
        let store = Arc::new(MemoryStore::new());
        let registry = PendingCloseRegistry::new(store.clone());

        registry.ensure_initialized().await.unwrap();
        assert_eq!(store.peek(TABS_TO_CLOSE_KEY), Some(serde_json::json!([])));

        registry.save(&[new_entry(&[], 1, 10, 5)]).await.unwrap();
        registry.ensure_initialized().await.unwrap();
        assert_eq!(registry.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_entries_skipped() {
        let store = Arc::new(MemoryStore::new());
        set_value(
            store.as_ref(),
            TABS_TO_CLOSE_KEY,
            serde_json::json!([
                {"tabId": 4, "closeTime": 100, "alarmName": "close_tab_4_1", "createdAt": 1},
                {"tabId": "nope"}
            ]),
        )
        .await
        .unwrap();

        let registry = PendingCloseRegistry::new(store);
        let entries = registry.load().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tab_id, 4);
    }

    #[test]
    fn test_new_entry_names_are_unique() {
        let first = new_entry(&[], 9, 500, 1_000);
        assert_eq!(first.alarm_name, "close_tab_9_1000");

        let second = new_entry(std::slice::from_ref(&first), 9, 600, 1_000);
        assert_eq!(second.alarm_name, "close_tab_9_1001");
        assert_eq!(second.created_at, 1_001);
    }
}
