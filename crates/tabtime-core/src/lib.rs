//! # TabTime Core
//!
//! Shared vocabulary for the TabTime background scheduler: persisted data
//! model, collaborator traits (store, alarms, tabs, clock), configuration
//! and the error taxonomy.
//!
//! The scheduler never talks to a concrete browser or disk directly. Every
//! host capability is an injected trait object, so the same scheduling code
//! runs against the file-backed host in the `tabtime` binary and against
//! the in-memory fakes in [`memory`] during tests.

pub mod config;
pub mod error;
pub mod file_store;
pub mod memory;
pub mod traits;
pub mod types;

pub use config::TabTimeConfig;
pub use error::{Result, TabTimeError};
pub use traits::{AlarmFacility, Clock, KeyValueStore, SystemClock, TabHost};
pub use types::{Alarm, AlarmKind, AutoClose, LockRecord, PendingCloseEntry, ScheduleEntry, StoreChange, Tab};
