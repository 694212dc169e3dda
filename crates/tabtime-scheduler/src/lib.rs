//! # TabTime Scheduler
//!
//! Background scheduling and tab lifecycle for TabTime.
//!
//! ## Architecture
//! ```text
//! TabTimeService (event loop)
//!   ├── sync store change "schedules" → RecurringOpenScheduler::rebuild_all
//!   ├── alarm fired → AlarmKind::parse
//!   │     ├── ScheduleFire(i) → RecurringOpenScheduler::on_alarm_fired
//!   │     │                       ├── TabHost::create (one tab per URL)
//!   │     │                       └── TabCloseScheduler::schedule
//!   │     └── CloseFire{..}  → TabCloseScheduler::on_alarm → TabHost::remove
//!   ├── tab removed → TabCloseScheduler::remove_by_tab
//!   └── install / startup → rebuild_all + reconcile_on_startup
//!
//! PendingCloseRegistry ("tabsToClose") ── guarded by StorageLock ("tabsToCloseLock")
//! ```
//!
//! Persisted state is the source of truth. Alarms are wake-up triggers that
//! can always be re-derived from it.

pub mod lock;
pub mod recurring;
pub mod registry;
pub mod service;
pub mod tab_close;
pub mod time;

pub use lock::StorageLock;
pub use recurring::{FireReport, RecurringOpenScheduler};
pub use registry::PendingCloseRegistry;
pub use service::{Host, Launch, TabTimeService};
pub use tab_close::{ReconcileReport, TabCloseScheduler};
