//! Alarm facility trait.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::Alarm;

/// Named, coarse, at-least-once wake-up timers.
///
/// Alarms carry no payload beyond their name and fire time. Firings may be
/// delayed or coalesced by the host.
#[async_trait]
pub trait AlarmFacility: Send + Sync {
    /// Arm `name` to fire at `when_ms` (epoch ms), replacing any alarm with
    /// the same name.
    async fn create(&self, name: &str, when_ms: i64) -> Result<()>;

    /// Cancel `name`. Returns whether an alarm was actually cleared.
    async fn clear(&self, name: &str) -> Result<bool>;

    /// Every pending alarm.
    async fn get_all(&self) -> Result<Vec<Alarm>>;

    /// Fired alarms.
    fn subscribe(&self) -> broadcast::Receiver<Alarm>;
}
