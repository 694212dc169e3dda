//! Background service — routes host events to the two schedulers.
//!
//! Events are handled on their own tasks, so several may be in flight at
//! once. Registry mutations stay consistent through the storage lock; alarm
//! routing decodes the name once into an [`AlarmKind`].

use std::sync::Arc;

use tabtime_core::config::LockConfig;
use tabtime_core::error::{Result, TabTimeError};
use tabtime_core::traits::store::{get_value, set_value};
use tabtime_core::traits::{AlarmFacility, Clock, KeyValueStore, TabHost};
use tabtime_core::types::{Alarm, AlarmKind, INSTALLED_VERSION_KEY, SCHEDULES_KEY, StoreChange};
use tokio::sync::{broadcast, watch};

use crate::lock::StorageLock;
use crate::recurring::RecurringOpenScheduler;
use crate::registry::PendingCloseRegistry;
use crate::tab_close::TabCloseScheduler;

/// Host capabilities the service runs against.
#[derive(Clone)]
pub struct Host {
    /// Synced scope: the user's schedules.
    pub sync: Arc<dyn KeyValueStore>,
    /// Device-local scope: pending closes and locks.
    pub local: Arc<dyn KeyValueStore>,
    pub alarms: Arc<dyn AlarmFacility>,
    pub tabs: Arc<dyn TabHost>,
    pub clock: Arc<dyn Clock>,
}

/// How the service was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    Install,
    Update,
    Startup,
}

#[derive(Clone)]
pub struct TabTimeService {
    host: Host,
    opener: RecurringOpenScheduler,
    closer: TabCloseScheduler,
}

impl TabTimeService {
    pub fn new(host: Host, lock_config: LockConfig) -> Self {
        let lock = StorageLock::new(host.local.clone(), host.clock.clone(), lock_config);
        let closer = TabCloseScheduler::new(
            PendingCloseRegistry::new(host.local.clone()),
            lock,
            host.alarms.clone(),
            host.tabs.clone(),
            host.clock.clone(),
        );
        let opener = RecurringOpenScheduler::new(
            host.sync.clone(),
            host.alarms.clone(),
            host.tabs.clone(),
            host.clock.clone(),
            closer.clone(),
        );
        Self {
            host,
            opener,
            closer,
        }
    }

    pub fn opener(&self) -> &RecurringOpenScheduler {
        &self.opener
    }

    pub fn closer(&self) -> &TabCloseScheduler {
        &self.closer
    }

    /// Compare the stored version with `version` and record it.
    pub async fn detect_launch(&self, version: &str) -> Result<Launch> {
        let stored = get_value(self.host.local.as_ref(), INSTALLED_VERSION_KEY).await?;
        let launch = match stored.as_ref().and_then(|v| v.as_str()) {
            None => Launch::Install,
            Some(v) if v != version => Launch::Update,
            Some(_) => Launch::Startup,
        };
        if launch != Launch::Startup {
            set_value(self.host.local.as_ref(), INSTALLED_VERSION_KEY, version.into()).await?;
        }
        Ok(launch)
    }

    /// Run the lifecycle hooks for `launch`.
    pub async fn launch(&self, launch: Launch) -> Result<()> {
        match launch {
            Launch::Install => self.on_installed().await,
            Launch::Update => {
                self.on_installed().await?;
                self.closer.reconcile_on_startup().await.map(|_| ())
            }
            Launch::Startup => self.on_startup().await,
        }
    }

    /// First install or update.
    pub async fn on_installed(&self) -> Result<()> {
        tracing::info!("📦 Installed, scheduling from persisted state");
        self.opener.rebuild_all().await?;
        self.closer.registry().ensure_initialized().await
    }

    /// Host restart.
    pub async fn on_startup(&self) -> Result<()> {
        tracing::info!("🚀 Startup, rebuilding alarms");
        self.opener.rebuild_all().await?;
        self.closer.reconcile_on_startup().await?;
        Ok(())
    }

    /// Sync-scope change. Only `schedules` matters.
    pub async fn on_sync_changed(&self, change: &StoreChange) -> Result<()> {
        if change.touches(SCHEDULES_KEY) {
            tracing::info!("✏️ Schedules changed, rebuilding alarms");
            self.opener.rebuild_all().await?;
        }
        Ok(())
    }

    pub async fn on_alarm(&self, alarm: &Alarm) -> Result<()> {
        match AlarmKind::parse(&alarm.name) {
            AlarmKind::ScheduleFire(index) => {
                self.opener.on_alarm_fired(index).await?;
            }
            AlarmKind::CloseFire { .. } => {
                self.closer.on_alarm(&alarm.name).await?;
            }
            AlarmKind::Unknown if AlarmKind::is_ours(&alarm.name) => {
                // Nothing will ever re-arm or consume it under this spelling.
                tracing::warn!("⚠️ {}, clearing", TabTimeError::OrphanedAlarm(alarm.name.clone()));
                self.host.alarms.clear(&alarm.name).await?;
            }
            AlarmKind::Unknown => {
                tracing::debug!("Ignoring unknown alarm '{}'", alarm.name);
            }
        }
        Ok(())
    }

    pub async fn on_tab_removed(&self, tab_id: i64) -> Result<()> {
        self.closer.remove_by_tab(tab_id).await.map(|_| ())
    }

    /// Event loop over alarm firings, sync-store changes and tab removals.
    /// Returns once `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut alarms = self.host.alarms.subscribe();
        let mut changes = self.host.sync.subscribe();
        let mut removed = self.host.tabs.subscribe_removed();

        tracing::info!("⏰ TabTime service running");

        let (mut alarms_open, mut changes_open, mut removed_open) = (true, true, true);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = alarms.recv(), if alarms_open => match received("alarm", event) {
                    Received::Event(alarm) => {
                        let service = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = service.on_alarm(&alarm).await {
                                tracing::error!("❌ Alarm '{}' failed: {e}", alarm.name);
                            }
                        });
                    }
                    Received::Closed => alarms_open = false,
                    Received::Lagged => {}
                },
                event = changes.recv(), if changes_open => match received("store change", event) {
                    Received::Event(change) => {
                        let service = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = service.on_sync_changed(&change).await {
                                tracing::error!("❌ Rebuild after schedule change failed: {e}");
                            }
                        });
                    }
                    Received::Closed => changes_open = false,
                    Received::Lagged => {}
                },
                event = removed.recv(), if removed_open => match received("tab removal", event) {
                    Received::Event(tab_id) => {
                        let service = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = service.on_tab_removed(tab_id).await {
                                tracing::error!("❌ Cleanup for removed tab {} failed: {e}", tab_id);
                            }
                        });
                    }
                    Received::Closed => removed_open = false,
                    Received::Lagged => {}
                },
            }
        }

        tracing::info!("👋 TabTime service stopped");
    }
}

enum Received<T> {
    Event(T),
    Lagged,
    Closed,
}

fn received<T>(what: &str, event: std::result::Result<T, broadcast::error::RecvError>) -> Received<T> {
    match event {
        Ok(value) => Received::Event(value),
        Err(broadcast::error::RecvError::Lagged(n)) => {
            tracing::warn!("⚠️ Dropped {} {} event(s), next startup reconciles", n, what);
            Received::Lagged
        }
        Err(broadcast::error::RecvError::Closed) => {
            tracing::debug!("{} channel closed", what);
            Received::Closed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use std::time::Duration;
    use tabtime_core::memory::{ManualClock, MemoryAlarms, MemoryStore, MemoryTabs};

    struct Fixture {
        sync: Arc<MemoryStore>,
        local: Arc<MemoryStore>,
        alarms: Arc<MemoryAlarms>,
        tabs: Arc<MemoryTabs>,
        service: Arc<TabTimeService>,
    }

    fn fixture() -> Fixture {
        let sync = Arc::new(MemoryStore::new());
        let local = Arc::new(MemoryStore::new());
        let alarms = Arc::new(MemoryAlarms::new());
        let tabs = Arc::new(MemoryTabs::new());
        let clock = Arc::new(ManualClock::new(
            Local.with_ymd_and_hms(2026, 6, 15, 10, 0, 0).unwrap(),
        ));
        let host = Host {
            sync: sync.clone(),
            local: local.clone(),
            alarms: alarms.clone(),
            tabs: tabs.clone(),
            clock,
        };
        let service = Arc::new(TabTimeService::new(
            host,
            LockConfig {
                initial_wait_ms: 1,
                ..LockConfig::default()
            },
        ));
        Fixture {
            sync,
            local,
            alarms,
            tabs,
            service,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn alarm(name: &str) -> Alarm {
        Alarm {
            name: name.to_string(),
            scheduled_time: 0,
        }
    }

    #[tokio::test]
    async fn test_launch_detection() {
        let f = fixture();
        assert_eq!(f.service.detect_launch("0.2.0").await.unwrap(), Launch::Install);
        assert_eq!(f.service.detect_launch("0.2.0").await.unwrap(), Launch::Startup);
        assert_eq!(f.service.detect_launch("0.3.0").await.unwrap(), Launch::Update);
        assert_eq!(f.local.peek(INSTALLED_VERSION_KEY), Some("0.3.0".into()));
    }

    #[tokio::test]
    async fn test_install_initializes_registry() {
        let f = fixture();
        f.service.launch(Launch::Install).await.unwrap();
        assert_eq!(
            f.local.peek(tabtime_core::types::TABS_TO_CLOSE_KEY),
            Some(serde_json::json!([]))
        );
    }

    #[tokio::test]
    async fn test_only_schedule_changes_rebuild() {
        let f = fixture();
        set_value(
            f.sync.as_ref(),
            SCHEDULES_KEY,
            serde_json::json!([{"url": "https://a.com", "time": "11:00"}]),
        )
        .await
        .unwrap();

        f.service
            .on_sync_changed(&StoreChange { keys: vec!["theme".into()] })
            .await
            .unwrap();
        assert!(f.alarms.names().is_empty());

        f.service
            .on_sync_changed(&StoreChange { keys: vec![SCHEDULES_KEY.into()] })
            .await
            .unwrap();
        assert_eq!(f.alarms.names(), vec!["schedule_0"]);
    }

    #[tokio::test]
    async fn test_alarm_routing() {
        let f = fixture();
        set_value(
            f.sync.as_ref(),
            SCHEDULES_KEY,
            serde_json::json!([{
                "url": "https://a.com",
                "time": "10:00",
                "autoClose": "after-duration",
                "closeDuration": 5
            }]),
        )
        .await
        .unwrap();

        f.service.on_alarm(&alarm("schedule_0")).await.unwrap();
        let pending = f.service.closer().registry().load().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(f.tabs.open_tabs().len(), 1);

        f.service.on_alarm(&alarm(&pending[0].alarm_name)).await.unwrap();
        assert!(f.tabs.open_tabs().is_empty());

        f.service.on_alarm(&alarm("mystery")).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_own_alarm_is_cleared() {
        let f = fixture();
        let when = 1_800_000_000_000;
        f.alarms.create("schedule_+0", when).await.unwrap();
        f.alarms.create("close_tab_x_1", when).await.unwrap();
        f.alarms.create("mystery", when).await.unwrap();

        f.service.on_alarm(&alarm("schedule_+0")).await.unwrap();
        f.service.on_alarm(&alarm("close_tab_x_1")).await.unwrap();
        f.service.on_alarm(&alarm("mystery")).await.unwrap();

        assert_eq!(f.alarms.names(), vec!["mystery".to_string()]);
        assert!(f.tabs.open_tabs().is_empty());
    }

    #[tokio::test]
    async fn test_tab_removed_cleans_registry() {
        let f = fixture();
        let tab = f.tabs.create("https://a.com").await.unwrap();
        let entry = f.service.closer().schedule(tab.id, i64::MAX / 2).await.unwrap();

        f.service.on_tab_removed(tab.id).await.unwrap();
        assert!(f.service.closer().registry().load().await.unwrap().is_empty());
        assert!(f.alarms.scheduled(&entry.alarm_name).is_none());
    }

    #[tokio::test]
    async fn test_run_loop_end_to_end() {
        let f = fixture();
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(f.service.clone().run(shutdown));
        settle().await;

        // The options page saves a schedule.
        set_value(
            f.sync.as_ref(),
            SCHEDULES_KEY,
            serde_json::json!([{
                "url": "https://a.com;https://b.com",
                "time": "10:30",
                "autoClose": "after-duration",
                "closeDuration": 5
            }]),
        )
        .await
        .unwrap();
        settle().await;
        assert_eq!(f.alarms.names(), vec!["schedule_0"]);

        // Daily alarm fires: two tabs, two close alarms.
        f.alarms.fire("schedule_0").unwrap();
        settle().await;
        assert_eq!(f.tabs.open_tabs().len(), 2);
        let pending = f.service.closer().registry().load().await.unwrap();
        assert_eq!(pending.len(), 2);

        // The user closes one tab by hand; its close alarm goes away.
        let manual = pending[0].clone();
        f.tabs.remove(manual.tab_id).await.unwrap();
        settle().await;
        assert!(f.alarms.scheduled(&manual.alarm_name).is_none());

        // The other one closes on schedule.
        let scheduled = pending[1].clone();
        f.alarms.fire(&scheduled.alarm_name).unwrap();
        settle().await;
        assert!(f.tabs.open_tabs().is_empty());
        assert!(f.service.closer().registry().load().await.unwrap().is_empty());
        assert!(f.local.peek("tabsToCloseLock").is_none());

        stop.send(true).unwrap();
        handle.await.unwrap();
    }
}
