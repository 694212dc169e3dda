//! Tab management trait.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::Tab;

#[async_trait]
pub trait TabHost: Send + Sync {
    /// Open a new tab on `url`.
    async fn create(&self, url: &str) -> Result<Tab>;

    /// Look up a live tab. Fails with `TabNotFound` once it is gone.
    async fn get(&self, tab_id: i64) -> Result<Tab>;

    /// Close a tab. Fails with `TabNotFound` if it is already gone.
    async fn remove(&self, tab_id: i64) -> Result<()>;

    /// Ids of tabs closed for any reason (user, scheduler, crash).
    fn subscribe_removed(&self) -> broadcast::Receiver<i64>;
}
