//! Headless host capabilities for the `tabtime` binary.
//!
//! Alarms are tokio timers; tabs are tracked in memory and optionally handed
//! to a launcher command. Neither survives a restart, which is exactly what
//! startup reconciliation is for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tabtime_core::error::Result;
use tabtime_core::memory::MemoryTabs;
use tabtime_core::traits::{AlarmFacility, Clock, SystemClock, TabHost};
use tabtime_core::types::{Alarm, Tab};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct Armed {
    when_ms: i64,
    id: u64,
    timer: JoinHandle<()>,
}

struct TimerState {
    armed: Mutex<HashMap<String, Armed>>,
    fired: broadcast::Sender<Alarm>,
    next_id: AtomicU64,
}

impl TimerState {
    fn armed(&self) -> MutexGuard<'_, HashMap<String, Armed>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Alarm facility backed by one tokio timer per alarm.
pub struct TimerAlarms {
    state: Arc<TimerState>,
}

impl TimerAlarms {
    pub fn new() -> Self {
        let (fired, _) = broadcast::channel(256);
        Self {
            state: Arc::new(TimerState {
                armed: Mutex::new(HashMap::new()),
                fired,
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl Default for TimerAlarms {
    fn default() -> Self {
        Self::new()
    }
}

async fn fire_at(state: Weak<TimerState>, name: String, id: u64, when_ms: i64) {
    let delay = (when_ms - SystemClock.now_ms()).max(0) as u64;
    tokio::time::sleep(Duration::from_millis(delay)).await;

    let Some(state) = state.upgrade() else {
        return;
    };
    let still_current = {
        let mut armed = state.armed();
        match armed.get(&name) {
            Some(a) if a.id == id => {
                armed.remove(&name);
                true
            }
            _ => false,
        }
    };
    if still_current {
        tracing::debug!("⏰ Alarm '{}' fired", name);
        let _ = state.fired.send(Alarm {
            name,
            scheduled_time: when_ms,
        });
    }
}

#[async_trait]
impl AlarmFacility for TimerAlarms {
    async fn create(&self, name: &str, when_ms: i64) -> Result<()> {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        // Hold the map while spawning so an immediate timer cannot miss its own entry.
        let mut armed = self.state.armed();
        let timer = tokio::spawn(fire_at(Arc::downgrade(&self.state), name.to_string(), id, when_ms));
        if let Some(previous) = armed.insert(name.to_string(), Armed { when_ms, id, timer }) {
            previous.timer.abort();
        }
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<bool> {
        let removed = self.state.armed().remove(name);
        Ok(match removed {
            Some(armed) => {
                armed.timer.abort();
                true
            }
            None => false,
        })
    }

    async fn get_all(&self) -> Result<Vec<Alarm>> {
        Ok(self
            .state
            .armed()
            .iter()
            .map(|(name, armed)| Alarm {
                name: name.clone(),
                scheduled_time: armed.when_ms,
            })
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<Alarm> {
        self.state.fired.subscribe()
    }
}

/// In-memory tabs, optionally opened for real through a launcher command.
pub struct HeadlessTabs {
    tabs: MemoryTabs,
    launcher: Option<Vec<String>>,
}

impl HeadlessTabs {
    pub fn new(launcher: Option<&str>) -> Self {
        let launcher = launcher
            .map(|cmd| cmd.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|parts| !parts.is_empty());
        Self {
            tabs: MemoryTabs::new(),
            launcher,
        }
    }

    fn launch(&self, url: &str) {
        let Some((program, args)) = self.launcher.as_ref().and_then(|p| p.split_first()) else {
            return;
        };
        let mut command = tokio::process::Command::new(program);
        command.args(args).arg(url);
        match command.spawn() {
            Ok(_) => tracing::debug!("🌐 Launched {} {}", program, url),
            Err(e) => tracing::warn!("⚠️ Launcher '{}' failed for {}: {e}", program, url),
        }
    }
}

#[async_trait]
impl TabHost for HeadlessTabs {
    async fn create(&self, url: &str) -> Result<Tab> {
        let tab = self.tabs.create(url).await?;
        tracing::info!("🌐 Tab {} opened: {}", tab.id, url);
        self.launch(url);
        Ok(tab)
    }

    async fn get(&self, tab_id: i64) -> Result<Tab> {
        self.tabs.get(tab_id).await
    }

    async fn remove(&self, tab_id: i64) -> Result<()> {
        self.tabs.remove(tab_id).await?;
        tracing::info!("🗙 Tab {} closed", tab_id);
        Ok(())
    }

    fn subscribe_removed(&self) -> broadcast::Receiver<i64> {
        self.tabs.subscribe_removed()
    }
}
