//! Recurring-open scheduler — daily `schedule_<index>` alarms.
//!
//! Alarms are never diffed against the schedule list: every rebuild clears
//! all `schedule_*` alarms and recreates them from the current list, so
//! edits, reorders and deletions cannot leave stale alarms behind.

use std::sync::Arc;

use chrono::{DateTime, Local};
use serde_json::Value;
use tabtime_core::error::{Result, TabTimeError};
use tabtime_core::traits::store::get_value;
use tabtime_core::traits::{AlarmFacility, Clock, KeyValueStore, TabHost};
use tabtime_core::types::{AlarmKind, AutoClose, SCHEDULE_ALARM_PREFIX, SCHEDULES_KEY, ScheduleEntry, Tab};

use crate::tab_close::TabCloseScheduler;
use crate::time;

/// Outcome of one fired schedule alarm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FireReport {
    /// Tabs opened for the entry.
    pub opened: Vec<Tab>,
    /// Close alarms registered for those tabs.
    pub close_alarms: Vec<String>,
    /// When the entry fires next, `None` if the alarm was dropped.
    pub next_fire_ms: Option<i64>,
}

#[derive(Clone)]
pub struct RecurringOpenScheduler {
    schedules: Arc<dyn KeyValueStore>,
    alarms: Arc<dyn AlarmFacility>,
    tabs: Arc<dyn TabHost>,
    clock: Arc<dyn Clock>,
    closer: TabCloseScheduler,
}

impl RecurringOpenScheduler {
    pub fn new(
        schedules: Arc<dyn KeyValueStore>,
        alarms: Arc<dyn AlarmFacility>,
        tabs: Arc<dyn TabHost>,
        clock: Arc<dyn Clock>,
        closer: TabCloseScheduler,
    ) -> Self {
        Self {
            schedules,
            alarms,
            tabs,
            clock,
            closer,
        }
    }

    /// Current schedule list, see [`load_schedules`].
    pub async fn load_schedules(&self) -> Result<Vec<ScheduleEntry>> {
        load_schedules(self.schedules.as_ref()).await
    }

    /// Clear every `schedule_*` alarm and arm one per valid entry.
    /// Returns the number of alarms armed.
    pub async fn rebuild_all(&self) -> Result<usize> {
        let schedules = self.load_schedules().await?;

        for alarm in self.alarms.get_all().await? {
            if alarm.name.starts_with(SCHEDULE_ALARM_PREFIX) {
                self.alarms.clear(&alarm.name).await?;
            }
        }

        let now = self.clock.now();
        let mut armed = 0;
        for (index, entry) in schedules.iter().enumerate() {
            if !entry.is_valid() {
                continue;
            }
            let Some(next) = time::next_fire(&entry.time, &now) else {
                let err = TabTimeError::MalformedTime(entry.time.clone());
                tracing::warn!("⚠️ Schedule #{} skipped: {err}", index);
                continue;
            };
            let name = schedule_alarm_name(index);
            self.alarms.create(&name, next.timestamp_millis()).await?;
            tracing::debug!("📅 {} armed for {}", name, next);
            armed += 1;
        }

        tracing::info!("📅 Rebuilt schedule alarms: {} armed from {} entries", armed, schedules.len());
        Ok(armed)
    }

    /// Open the tabs for schedule entry `index` and re-arm its alarm.
    pub async fn on_alarm_fired(&self, index: usize) -> Result<FireReport> {
        let name = schedule_alarm_name(index);

        // Re-read: the list may have changed since the alarm was armed.
        let schedules = self.load_schedules().await?;
        let Some(entry) = schedules.get(index).filter(|e| e.is_valid()) else {
            tracing::warn!("⚠️ {}, clearing", TabTimeError::OrphanedAlarm(name.clone()));
            self.alarms.clear(&name).await?;
            return Ok(FireReport::default());
        };

        let fired_at = self.clock.now();
        let mut report = FireReport::default();

        for url in entry.urls() {
            let tab = match self.tabs.create(url).await {
                Ok(tab) => tab,
                Err(e) => {
                    tracing::warn!("⚠️ Failed to open {}: {e}", url);
                    continue;
                }
            };
            tracing::info!("🔔 Schedule #{} opened {} in tab {}", index, url, tab.id);

            if let Some(close_at) = close_time_for(entry, &fired_at) {
                match self.closer.schedule(tab.id, close_at).await {
                    Ok(pending) => report.close_alarms.push(pending.alarm_name),
                    Err(e) => tracing::error!("❌ Failed to schedule close for tab {}: {e}", tab.id),
                }
            }
            report.opened.push(tab);
        }

        report.next_fire_ms = self.rearm(&name, &entry.time).await?;
        Ok(report)
    }

    async fn rearm(&self, name: &str, at: &str) -> Result<Option<i64>> {
        self.alarms.clear(name).await?;

        let now = self.clock.now();
        // `next_fire` rolls anything at or before `now` to the next day, so a
        // fire that is on time or late always lands on tomorrow's slot.
        let Some(next) = time::next_fire(at, &now) else {
            tracing::warn!("⚠️ Schedule '{}' has malformed time '{}', not re-armed", name, at);
            return Ok(None);
        };

        self.alarms.create(name, next.timestamp_millis()).await?;
        tracing::debug!("📅 {} re-armed for {}", name, next);
        Ok(Some(next.timestamp_millis()))
    }
}

/// Schedule list from the sync store, index-aligned with the stored array.
///
/// Entries that fail to decode become empty (invalid) entries so later
/// indices keep their alarm names.
pub async fn load_schedules(store: &dyn KeyValueStore) -> Result<Vec<ScheduleEntry>> {
    let Some(value) = get_value(store, SCHEDULES_KEY).await? else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = value else {
        tracing::warn!("⚠️ '{}' is not a list, treating as empty", SCHEDULES_KEY);
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value(item).unwrap_or_else(|e| {
                tracing::warn!("⚠️ Schedule #{} is malformed: {e}", index);
                ScheduleEntry::default()
            })
        })
        .collect())
}

/// Absolute close time for a tab opened at `fired_at`, if the entry asks for
/// one and its close settings are usable.
pub fn close_time_for(entry: &ScheduleEntry, fired_at: &DateTime<Local>) -> Option<i64> {
    match entry.auto_close {
        AutoClose::NoClose => None,
        AutoClose::AfterDuration => {
            let minutes = entry.close_duration.filter(|m| *m > 0)?;
            Some(fired_at.timestamp_millis() + i64::from(minutes) * 60_000)
        }
        AutoClose::AtTime => {
            let at = entry.close_time.as_deref()?;
            time::next_fire(at, fired_at).map(|t| t.timestamp_millis())
        }
    }
}

fn schedule_alarm_name(index: usize) -> String {
    AlarmKind::ScheduleFire(index)
        .alarm_name()
        .unwrap_or_else(|| format!("{SCHEDULE_ALARM_PREFIX}{index}"))
}
