//! Key-value store trait — one instance per scope (sync or local).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::StoreChange;

/// Asynchronous, eventually-consistent key/value store.
///
/// Offers no transactions or compare-and-swap; multi-step updates must be
/// serialized by the caller.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Values for the requested keys. Missing keys are absent from the map.
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>>;

    /// Write every entry of `items`.
    async fn set(&self, items: HashMap<String, Value>) -> Result<()>;

    /// Delete the given keys. Missing keys are ignored.
    async fn remove(&self, keys: &[&str]) -> Result<()>;

    /// Change notifications for writes and removals.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// Read one raw value.
pub async fn get_value(store: &dyn KeyValueStore, key: &str) -> Result<Option<Value>> {
    let mut values = store.get(&[key]).await?;
    Ok(values.remove(key))
}

/// Read and decode one key.
pub async fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match get_value(store, key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Encode and write one key.
pub async fn set_json<T: Serialize + Sync>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let mut items = HashMap::new();
    items.insert(key.to_string(), serde_json::to_value(value)?);
    store.set(items).await
}

/// Write one raw value.
pub async fn set_value(store: &dyn KeyValueStore, key: &str, value: Value) -> Result<()> {
    let mut items = HashMap::new();
    items.insert(key.to_string(), value);
    store.set(items).await
}
