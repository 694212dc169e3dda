//! In-memory collaborators.
//!
//! Used by the scheduler tests and by the headless host for tabs. None of
//! these suspend inside an operation, which matches a host that runs each
//! storage callback to completion.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{Result, TabTimeError};
use crate::traits::{AlarmFacility, Clock, KeyValueStore, TabHost};
use crate::types::{Alarm, StoreChange, Tab};

const CHANNEL_CAPACITY: usize = 256;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory key/value store for one scope.
pub struct MemoryStore {
    data: Mutex<HashMap<String, Value>>,
    changes: broadcast::Sender<StoreChange>,
    writes: AtomicUsize,
    refused: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            data: Mutex::new(HashMap::new()),
            changes,
            writes: AtomicUsize::new(0),
            refused: Mutex::new(HashSet::new()),
        }
    }

    /// Number of `set`/`remove` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every later `set` touching `key` fail without changing anything.
    pub fn refuse_writes_to(&self, key: &str) {
        guard(&self.refused).insert(key.to_string());
    }

    /// Raw value, bypassing the async interface.
    pub fn peek(&self, key: &str) -> Option<Value> {
        guard(&self.data).get(key).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>> {
        let data = guard(&self.data);
        Ok(keys
            .iter()
            .filter_map(|k| data.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<()> {
        let keys: Vec<String> = items.keys().cloned().collect();
        if let Some(key) = keys.iter().find(|k| guard(&self.refused).contains(*k)) {
            return Err(TabTimeError::Store(format!("write to '{key}' refused")));
        }
        guard(&self.data).extend(items);
        self.writes.fetch_add(1, Ordering::SeqCst);
        let _ = self.changes.send(StoreChange { keys });
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<()> {
        {
            let mut data = guard(&self.data);
            for key in keys {
                data.remove(*key);
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let _ = self.changes.send(StoreChange {
            keys: keys.iter().map(|k| k.to_string()).collect(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

/// Alarm facility that only fires when told to.
pub struct MemoryAlarms {
    alarms: Mutex<BTreeMap<String, i64>>,
    fired: broadcast::Sender<Alarm>,
}

impl MemoryAlarms {
    pub fn new() -> Self {
        let (fired, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            alarms: Mutex::new(BTreeMap::new()),
            fired,
        }
    }

    /// Fire time of a pending alarm.
    pub fn scheduled(&self, name: &str) -> Option<i64> {
        guard(&self.alarms).get(name).copied()
    }

    /// Names of every pending alarm, sorted.
    pub fn names(&self) -> Vec<String> {
        guard(&self.alarms).keys().cloned().collect()
    }

    /// Fire `name` now, consuming it like a one-shot alarm.
    pub fn fire(&self, name: &str) -> Option<Alarm> {
        let scheduled_time = guard(&self.alarms).remove(name)?;
        let alarm = Alarm {
            name: name.to_string(),
            scheduled_time,
        };
        let _ = self.fired.send(alarm.clone());
        Some(alarm)
    }
}

impl Default for MemoryAlarms {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlarmFacility for MemoryAlarms {
    async fn create(&self, name: &str, when_ms: i64) -> Result<()> {
        guard(&self.alarms).insert(name.to_string(), when_ms);
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<bool> {
        Ok(guard(&self.alarms).remove(name).is_some())
    }

    async fn get_all(&self) -> Result<Vec<Alarm>> {
        Ok(guard(&self.alarms)
            .iter()
            .map(|(name, when)| Alarm {
                name: name.clone(),
                scheduled_time: *when,
            })
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<Alarm> {
        self.fired.subscribe()
    }
}

/// Tab host keeping tabs in a map. Ids start at 1.
pub struct MemoryTabs {
    tabs: Mutex<BTreeMap<i64, Tab>>,
    next_id: AtomicI64,
    removed: broadcast::Sender<i64>,
}

impl MemoryTabs {
    pub fn new() -> Self {
        let (removed, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tabs: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            removed,
        }
    }

    pub fn open_tabs(&self) -> Vec<Tab> {
        guard(&self.tabs).values().cloned().collect()
    }

    pub fn is_open(&self, tab_id: i64) -> bool {
        guard(&self.tabs).contains_key(&tab_id)
    }
}

impl Default for MemoryTabs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TabHost for MemoryTabs {
    async fn create(&self, url: &str) -> Result<Tab> {
        let tab = Tab {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            url: url.to_string(),
        };
        guard(&self.tabs).insert(tab.id, tab.clone());
        Ok(tab)
    }

    async fn get(&self, tab_id: i64) -> Result<Tab> {
        guard(&self.tabs)
            .get(&tab_id)
            .cloned()
            .ok_or(TabTimeError::TabNotFound(tab_id))
    }

    async fn remove(&self, tab_id: i64) -> Result<()> {
        guard(&self.tabs)
            .remove(&tab_id)
            .ok_or(TabTimeError::TabNotFound(tab_id))?;
        let _ = self.removed.send(tab_id);
        Ok(())
    }

    fn subscribe_removed(&self) -> broadcast::Receiver<i64> {
        self.removed.subscribe()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Local>) {
        *guard(&self.now) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = guard(&self.now);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *guard(&self.now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_notifies_changes() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe();

        let mut items = HashMap::new();
        items.insert("schedules".to_string(), serde_json::json!([]));
        store.set(items).await.unwrap();

        let change = changes.recv().await.unwrap();
        assert!(change.touches("schedules"));
        assert_eq!(store.write_count(), 1);

        store.remove(&["schedules"]).await.unwrap();
        assert!(store.get(&["schedules"]).await.unwrap().is_empty());
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_refused_write_changes_nothing() {
        let store = MemoryStore::new();
        store.refuse_writes_to("tabsToClose");

        let mut items = HashMap::new();
        items.insert("tabsToClose".to_string(), serde_json::json!([]));
        items.insert("theme".to_string(), serde_json::json!("dark"));
        let err = store.set(items).await.unwrap_err();
        assert!(matches!(err, TabTimeError::Store(_)));
        assert!(store.peek("theme").is_none());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_tabs_remove_missing() {
        let tabs = MemoryTabs::new();
        let tab = tabs.create("https://a.com").await.unwrap();
        assert!(tabs.is_open(tab.id));

        tabs.remove(tab.id).await.unwrap();
        let err = tabs.remove(tab.id).await.unwrap_err();
        assert!(err.is_tab_not_found());
        assert!(tabs.get(tab.id).await.unwrap_err().is_tab_not_found());
    }

    #[tokio::test]
    async fn test_alarms_fire_once() {
        let alarms = MemoryAlarms::new();
        let mut fired = alarms.subscribe();
        alarms.create("schedule_0", 1_000).await.unwrap();
        alarms.create("schedule_0", 2_000).await.unwrap();
        assert_eq!(alarms.scheduled("schedule_0"), Some(2_000));

        assert!(alarms.fire("schedule_0").is_some());
        assert!(alarms.fire("schedule_0").is_none());
        assert_eq!(fired.recv().await.unwrap().scheduled_time, 2_000);
    }
}
