//! Advisory storage locks — named mutual exclusion over a flat key/value store.
//!
//! The store has no transactions, so a lock is an ordinary record under the
//! lock's name. Acquisition is optimistic: write a record with a fresh owner
//! token, read it back, and only trust it if the token survived. Contenders
//! back off exponentially. Records older than the stale threshold are taken
//! over, which bounds how long a crashed holder can block everyone else.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tabtime_core::config::LockConfig;
use tabtime_core::error::{Result, TabTimeError};
use tabtime_core::traits::store::{get_json, set_json};
use tabtime_core::traits::{Clock, KeyValueStore};
use tabtime_core::types::LockRecord;

/// Lock manager bound to one store scope.
#[derive(Clone)]
pub struct StorageLock {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
}

impl StorageLock {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: LockConfig) -> Self {
        Self { store, clock, config }
    }

    /// Take `name`, returning the owner token needed to release it.
    pub async fn acquire(&self, name: &str) -> Result<String> {
        for attempt in 0..self.config.max_attempts {
            let now = self.clock.now_ms();
            let current: Option<LockRecord> = self.read(name).await?;

            let free = match &current {
                None => true,
                Some(lock) if lock.is_stale(now, self.config.stale_after_ms) => {
                    tracing::warn!(
                        "🔓 Lock '{}' held by {} is stale ({}ms old), taking over",
                        name,
                        lock.owner,
                        now - lock.timestamp
                    );
                    true
                }
                Some(_) => false,
            };

            if free {
                let record = LockRecord {
                    acquired: true,
                    timestamp: now,
                    owner: new_owner_token(now),
                };
                set_json(self.store.as_ref(), name, &record).await?;

                // Another writer may have overwritten the key between write and read-back.
                let verified = self.read(name).await?;
                if verified.as_ref().map(|l| l.owner.as_str()) == Some(record.owner.as_str()) {
                    tracing::debug!("🔒 Lock '{}' acquired by {}", name, record.owner);
                    return Ok(record.owner);
                }
            }

            let wait = self.backoff(attempt);
            tracing::debug!(
                "⏳ Lock '{}' busy (attempt {}/{}), retrying in {}ms",
                name,
                attempt + 1,
                self.config.max_attempts,
                wait.as_millis()
            );
            tokio::time::sleep(wait).await;
        }

        Err(TabTimeError::LockTimeout(name.to_string()))
    }

    /// Release `name` if `owner` holds it.
    ///
    /// Returns `true` when the lock was released or was not held at all,
    /// `false` when someone else holds it.
    pub async fn release(&self, name: &str, owner: &str) -> Result<bool> {
        match self.read(name).await? {
            None => Ok(true),
            Some(lock) if lock.owner == owner => {
                self.store.remove(&[name]).await?;
                tracing::debug!("🔓 Lock '{}' released by {}", name, owner);
                Ok(true)
            }
            Some(lock) => {
                tracing::debug!("Lock '{}' now belongs to {}, not {}", name, lock.owner, owner);
                Ok(false)
            }
        }
    }

    /// Run `body` while holding `name`.
    ///
    /// The lock is released after `body` finishes, whether it returned `Ok`
    /// or `Err`. If acquisition fails, `body` never runs and nothing is
    /// released. A dropped future leaves the record behind until it goes stale.
    pub async fn with_lock<T, F, Fut>(&self, name: &str, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let owner = self.acquire(name).await?;
        let outcome = body().await;

        match self.release(name, &owner).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("⚠️ Lock '{}' was taken over before release", name),
            Err(e) => tracing::warn!("⚠️ Failed to release lock '{}': {e}", name),
        }

        outcome
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.config.initial_wait_ms.saturating_mul(factor))
    }

    async fn read(&self, name: &str) -> Result<Option<LockRecord>> {
        // An unreadable record is treated like a stale one.
        match get_json::<LockRecord>(self.store.as_ref(), name).await {
            Ok(lock) => Ok(lock),
            Err(TabTimeError::Json(e)) => {
                tracing::warn!("⚠️ Corrupt lock record '{}': {e}", name);
                Ok(Some(LockRecord {
                    acquired: true,
                    timestamp: i64::MIN / 2,
                    owner: String::new(),
                }))
            }
            Err(e) => Err(e),
        }
    }
}

fn new_owner_token(now_ms: i64) -> String {
    format!("worker_{}_{}", now_ms, uuid::Uuid::new_v4().simple())
}
