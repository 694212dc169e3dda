//! Tab-close scheduling — arms, fires and reconciles close alarms against the
//! pending-close registry.
//!
//! Ordering rules:
//! - registry writes happen under `tabsToCloseLock`;
//! - a new entry is persisted before its alarm is armed, so a crash in
//!   between is repaired by [`TabCloseScheduler::reconcile_on_startup`];
//! - tabs are closed outside the lock.

use std::sync::Arc;

use tabtime_core::error::{Result, TabTimeError};
use tabtime_core::traits::{AlarmFacility, Clock, TabHost};
use tabtime_core::types::{PendingCloseEntry, TABS_TO_CLOSE_LOCK};

use crate::lock::StorageLock;
use crate::registry::{self, PendingCloseRegistry};

/// What startup reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries whose alarm was re-armed.
    pub rearmed: usize,
    /// Overdue entries whose tab was closed immediately.
    pub closed: usize,
    /// Entries dropped because their tab no longer exists.
    pub dropped: usize,
}

#[derive(Clone)]
pub struct TabCloseScheduler {
    registry: PendingCloseRegistry,
    lock: StorageLock,
    alarms: Arc<dyn AlarmFacility>,
    tabs: Arc<dyn TabHost>,
    clock: Arc<dyn Clock>,
}

impl TabCloseScheduler {
    pub fn new(
        registry: PendingCloseRegistry,
        lock: StorageLock,
        alarms: Arc<dyn AlarmFacility>,
        tabs: Arc<dyn TabHost>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            lock,
            alarms,
            tabs,
            clock,
        }
    }

    pub fn registry(&self) -> &PendingCloseRegistry {
        &self.registry
    }

    /// Register `tab_id` to close at `close_at_ms` and arm its alarm.
    /// Returns the new entry.
    pub async fn schedule(&self, tab_id: i64, close_at_ms: i64) -> Result<PendingCloseEntry> {
        let entry = self
            .lock
            .with_lock(TABS_TO_CLOSE_LOCK, || async {
                let mut entries = self.registry.load().await?;
                let entry = registry::new_entry(&entries, tab_id, close_at_ms, self.clock.now_ms());
                entries.push(entry.clone());
                self.registry.save(&entries).await?;
                Ok::<_, TabTimeError>(entry)
            })
            .await?;

        self.alarms.create(&entry.alarm_name, close_at_ms).await?;
        tracing::info!(
            "⏲️ Tab {} will close at {} ({})",
            tab_id,
            close_at_ms,
            entry.alarm_name
        );
        Ok(entry)
    }

    /// Remove the entry for a fired close alarm. `None` if it was already
    /// cleaned up (e.g. the tab was closed by the user first).
    pub async fn handle_fired(&self, alarm_name: &str) -> Result<Option<PendingCloseEntry>> {
        self.lock
            .with_lock(TABS_TO_CLOSE_LOCK, || async {
                let mut entries = self.registry.load().await?;
                let Some(pos) = entries.iter().position(|e| e.alarm_name == alarm_name) else {
                    tracing::debug!("No pending-close entry for alarm '{}'", alarm_name);
                    return Ok(None);
                };
                let entry = entries.remove(pos);
                self.registry.save(&entries).await?;
                Ok::<_, TabTimeError>(Some(entry))
            })
            .await
    }

    /// Handle a fired close alarm end to end: drop the entry, then close the
    /// tab. A tab that is already gone only produces a warning.
    pub async fn on_alarm(&self, alarm_name: &str) -> Result<()> {
        let Some(entry) = self.handle_fired(alarm_name).await? else {
            return Ok(());
        };
        self.close_tab(entry.tab_id).await;
        Ok(())
    }

    /// Forget every pending close for a tab that was closed elsewhere.
    /// Returns how many entries were removed.
    pub async fn remove_by_tab(&self, tab_id: i64) -> Result<usize> {
        self.lock
            .with_lock(TABS_TO_CLOSE_LOCK, || async {
                let entries = self.registry.load().await?;
                let (matching, remaining): (Vec<_>, Vec<_>) =
                    entries.into_iter().partition(|e| e.tab_id == tab_id);
                if matching.is_empty() {
                    return Ok(0);
                }

                // Alarms do not disappear when the registry changes.
                for entry in &matching {
                    self.clear_alarm(&entry.alarm_name).await;
                }
                self.registry.save(&remaining).await?;
                tracing::info!("🧹 Removed {} pending close(s) for tab {}", matching.len(), tab_id);
                Ok::<_, TabTimeError>(matching.len())
            })
            .await
    }

    /// Rebuild close alarms from the registry after a restart.
    pub async fn reconcile_on_startup(&self) -> Result<ReconcileReport> {
        self.lock
            .with_lock(TABS_TO_CLOSE_LOCK, || async {
                let entries = self.registry.load().await?;
                let now = self.clock.now_ms();
                let mut report = ReconcileReport::default();
                let mut keep = Vec::with_capacity(entries.len());

                for entry in &entries {
                    match self.tabs.get(entry.tab_id).await {
                        Ok(_) if entry.close_time > now => {
                            self.alarms.create(&entry.alarm_name, entry.close_time).await?;
                            keep.push(entry.clone());
                            report.rearmed += 1;
                        }
                        Ok(_) => {
                            self.close_tab(entry.tab_id).await;
                            report.closed += 1;
                        }
                        Err(e) => {
                            if !e.is_tab_not_found() {
                                tracing::warn!("⚠️ Could not probe tab {}: {e}", entry.tab_id);
                            }
                            self.clear_alarm(&entry.alarm_name).await;
                            report.dropped += 1;
                        }
                    }
                }

                if keep.len() != entries.len() {
                    self.registry.save(&keep).await?;
                }
                tracing::info!(
                    "🔁 Pending closes reconciled: {} re-armed, {} closed, {} dropped",
                    report.rearmed,
                    report.closed,
                    report.dropped
                );
                Ok::<_, TabTimeError>(report)
            })
            .await
    }

    async fn close_tab(&self, tab_id: i64) {
        match self.tabs.remove(tab_id).await {
            Ok(()) => tracing::info!("❎ Closed tab {}", tab_id),
            Err(e) => tracing::warn!("⚠️ Cannot close tab {}: {e}", tab_id),
        }
    }

    async fn clear_alarm(&self, name: &str) {
        if let Err(e) = self.alarms.clear(name).await {
            tracing::warn!("⚠️ Failed to clear alarm '{}': {e}", name);
        }
    }
}
