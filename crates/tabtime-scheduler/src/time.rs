//! Daily "HH:MM" time math.
//! Only hours and minutes; a day rolls over when the target is not ahead of `now`.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};

/// Parse "HH:MM" (hours 0-23, minutes 0-59).
pub fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    let (hours, minutes) = value.trim().split_once(':')?;
    let hours: u32 = hours.trim().parse().ok()?;
    let minutes: u32 = minutes.trim().parse().ok()?;
    if hours > 23 || minutes > 59 {
        tracing::warn!("Invalid time string: '{}' (need HH:MM)", value);
        return None;
    }
    NaiveTime::from_hms_opt(hours, minutes, 0)
}

/// Next instant strictly after `now` whose wall-clock time is `value`.
///
/// Returns `None` for malformed input.
pub fn next_fire<Tz: TimeZone>(value: &str, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let time = parse_hhmm(value)?;
    let tz = now.timezone();
    let today = now.date_naive();

    let target = resolve_local(&tz, today, time)?;
    if target > *now {
        return Some(target);
    }
    let tomorrow = today.checked_add_days(Days::new(1))?;
    resolve_local(&tz, tomorrow, time)
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>> {
    resolve_naive(tz, date.and_time(time))
}

// Ambiguous wall-clock times take the earlier instant; times inside a DST
// gap move forward an hour.
fn resolve_naive<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive).earliest().or_else(|| {
        let shifted = naive + chrono::Duration::hours(1);
        tz.from_local_datetime(&shifted).earliest()
    })
}
