//! Host capabilities the scheduler is written against.

pub mod alarms;
pub mod clock;
pub mod store;
pub mod tabs;

pub use alarms::AlarmFacility;
pub use clock::{Clock, SystemClock};
pub use store::KeyValueStore;
pub use tabs::TabHost;
