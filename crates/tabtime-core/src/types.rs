//! Persisted data model and alarm naming.
//!
//! Field names follow the JSON schema the options page writes (`camelCase`),
//! so the UI and the scheduler share `schedules` without translation.

use serde::{Deserialize, Deserializer, Serialize};

/// Sync-scope key holding the schedule list.
pub const SCHEDULES_KEY: &str = "schedules";
/// Local-scope key holding the pending-close registry.
pub const TABS_TO_CLOSE_KEY: &str = "tabsToClose";
/// Lock guarding [`TABS_TO_CLOSE_KEY`].
pub const TABS_TO_CLOSE_LOCK: &str = "tabsToCloseLock";
/// Local-scope key recording the last installed version.
pub const INSTALLED_VERSION_KEY: &str = "installedVersion";

pub const SCHEDULE_ALARM_PREFIX: &str = "schedule_";
pub const CLOSE_ALARM_PREFIX: &str = "close_tab_";

/// What to do with an opened tab.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AutoClose {
    #[default]
    NoClose,
    AfterDuration,
    AtTime,
}

impl AutoClose {
    fn from_loose(value: &str) -> Self {
        match value {
            "after-duration" => AutoClose::AfterDuration,
            "at-time" => AutoClose::AtTime,
            _ => AutoClose::NoClose,
        }
    }
}

/// A user-defined rule: open URL(s) daily at `time`, optionally close later.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub time: String,
    #[serde(default, deserialize_with = "de_auto_close")]
    pub auto_close: AutoClose,
    #[serde(default, deserialize_with = "de_loose_minutes", skip_serializing_if = "Option::is_none")]
    pub close_duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_time: Option<String>,
}

impl ScheduleEntry {
    /// Both `url` and `time` are present.
    pub fn is_valid(&self) -> bool {
        !self.url.trim().is_empty() && !self.time.trim().is_empty()
    }

    /// Individual URLs of a `;`-joined entry.
    pub fn urls(&self) -> Vec<&str> {
        self.url
            .split(';')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .collect()
    }
}

fn de_auto_close<'de, D>(deserializer: D) -> Result<AutoClose, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(|v| v.as_str())
        .map(AutoClose::from_loose)
        .unwrap_or_default())
}

// The options page has stored minutes both as numbers and as strings.
fn de_loose_minutes<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse::<u32>().ok(),
        _ => None,
    })
}

/// A persisted record of one tab awaiting a scheduled close.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingCloseEntry {
    pub tab_id: i64,
    /// Absolute close time, epoch milliseconds.
    pub close_time: i64,
    pub alarm_name: String,
    pub created_at: i64,
}

/// Advisory lock record stored under the lock's name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub acquired: bool,
    /// Acquisition time, epoch milliseconds.
    pub timestamp: i64,
    pub owner: String,
}

impl LockRecord {
    pub fn is_stale(&self, now_ms: i64, stale_after_ms: i64) -> bool {
        now_ms - self.timestamp > stale_after_ms
    }
}

/// A pending alarm as reported by the alarm facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    pub name: String,
    /// Fire time, epoch milliseconds.
    pub scheduled_time: i64,
}

/// A browser tab as reported by the tab host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tab {
    pub id: i64,
    pub url: String,
}

/// Keys that changed in one store write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub keys: Vec<String>,
}

impl StoreChange {
    pub fn touches(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

/// Alarm names decoded once at the dispatch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    /// Daily open for the schedule entry at this index.
    ScheduleFire(usize),
    /// One-shot close for a pending-close entry.
    CloseFire { tab_id: i64, created_at: i64 },
    Unknown,
}

/// Number in canonical form: ASCII digits, no sign, no leading zero.
fn parse_digits<T: std::str::FromStr>(part: &str) -> Option<T> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if part.len() > 1 && part.starts_with('0') {
        return None;
    }
    part.parse().ok()
}

impl AlarmKind {
    pub fn parse(name: &str) -> Self {
        if let Some(rest) = name.strip_prefix(CLOSE_ALARM_PREFIX) {
            let mut parts = rest.splitn(2, '_');
            let tab_id = parts.next().and_then(parse_digits::<i64>);
            let created_at = parts.next().and_then(parse_digits::<i64>);
            return match (tab_id, created_at) {
                (Some(tab_id), Some(created_at)) => AlarmKind::CloseFire { tab_id, created_at },
                _ => AlarmKind::Unknown,
            };
        }
        if let Some(rest) = name.strip_prefix(SCHEDULE_ALARM_PREFIX) {
            return parse_digits::<usize>(rest)
                .map(AlarmKind::ScheduleFire)
                .unwrap_or(AlarmKind::Unknown);
        }
        AlarmKind::Unknown
    }

    /// Whether `name` uses one of our prefixes, decodable or not.
    pub fn is_ours(name: &str) -> bool {
        name.starts_with(SCHEDULE_ALARM_PREFIX) || name.starts_with(CLOSE_ALARM_PREFIX)
    }

    /// Canonical alarm name, `None` for [`AlarmKind::Unknown`].
    pub fn alarm_name(&self) -> Option<String> {
        match self {
            AlarmKind::ScheduleFire(index) => Some(format!("{SCHEDULE_ALARM_PREFIX}{index}")),
            AlarmKind::CloseFire { tab_id, created_at } => {
                Some(format!("{CLOSE_ALARM_PREFIX}{tab_id}_{created_at}"))
            }
            AlarmKind::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alarm_kind_names() {
        assert_eq!(AlarmKind::parse("schedule_3"), AlarmKind::ScheduleFire(3));
        assert_eq!(
            AlarmKind::parse("close_tab_42_1700000000000"),
            AlarmKind::CloseFire { tab_id: 42, created_at: 1_700_000_000_000 }
        );
        assert_eq!(AlarmKind::parse("schedule_x"), AlarmKind::Unknown);
        assert_eq!(AlarmKind::parse("close_tab_42"), AlarmKind::Unknown);
        assert_eq!(AlarmKind::parse("something_else"), AlarmKind::Unknown);
        assert_eq!(AlarmKind::parse("schedule_0"), AlarmKind::ScheduleFire(0));

        // Names that would re-arm under a different spelling.
        for name in ["schedule_+3", "schedule_03", "schedule_ 3", "schedule_", "close_tab_+4_5", "close_tab_4_-5"] {
            assert_eq!(AlarmKind::parse(name), AlarmKind::Unknown, "{name}");
            assert!(AlarmKind::is_ours(name));
        }
        assert!(!AlarmKind::is_ours("something_else"));

        let kind = AlarmKind::CloseFire { tab_id: 7, created_at: 99 };
        assert_eq!(kind.alarm_name().as_deref(), Some("close_tab_7_99"));
        assert_eq!(AlarmKind::parse(&kind.alarm_name().unwrap()), kind);
        assert!(AlarmKind::Unknown.alarm_name().is_none());
    }

    #[test]
    fn test_schedule_entry_lenient_decoding() {
        let entry: ScheduleEntry = serde_json::from_value(serde_json::json!({
            "url": "https://a.com",
            "time": "10:00",
            "autoClose": "after-duration",
            "closeDuration": "5"
        }))
        .unwrap();
        assert_eq!(entry.auto_close, AutoClose::AfterDuration);
        assert_eq!(entry.close_duration, Some(5));

        let entry: ScheduleEntry = serde_json::from_value(serde_json::json!({
            "url": "https://a.com",
            "time": "10:00",
            "autoClose": "whenever",
            "closeDuration": "soon"
        }))
        .unwrap();
        assert_eq!(entry.auto_close, AutoClose::NoClose);
        assert_eq!(entry.close_duration, None);

        let entry: ScheduleEntry = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(!entry.is_valid());
    }

    #[test]
    fn test_schedule_entry_serializes_schema_names() {
        let entry = ScheduleEntry {
            url: "https://a.com".into(),
            time: "09:30".into(),
            auto_close: AutoClose::AtTime,
            close_duration: None,
            close_time: Some("10:00".into()),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["autoClose"], "at-time");
        assert_eq!(value["closeTime"], "10:00");
        assert!(value.get("closeDuration").is_none());
    }

    #[test]
    fn test_multi_url_split() {
        let entry = ScheduleEntry {
            url: "https://a.com; https://b.com;".into(),
            time: "08:00".into(),
            ..Default::default()
        };
        assert_eq!(entry.urls(), vec!["https://a.com", "https://b.com"]);
    }

    #[test]
    fn test_lock_staleness() {
        let lock = LockRecord { acquired: true, timestamp: 1_000, owner: "w".into() };
        assert!(!lock.is_stale(16_000, 15_000));
        assert!(lock.is_stale(16_001, 15_000));
    }
}
