use chrono::{DateTime, Local, LocalResult, NaiveDate, TimeZone, Timelike};
use input_tracker::StoredActivity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HourTotal {
    pub hour: u32,
    pub active_seconds: i64,
    pub active_minutes: usize,
}

/// Groups rows by local hour, skipping hours without activity.
pub fn hourly_totals(rows: &[StoredActivity]) -> Vec<HourTotal> {
    let mut hours: Vec<HourTotal> = (0..24)
        .map(|hour| HourTotal {
            hour,
            active_seconds: 0,
            active_minutes: 0,
        })
        .collect();

    for row in rows {
        let Some(local) = local_datetime(row.minute_ts) else {
            continue;
        };
        let slot = &mut hours[local.hour() as usize];
        slot.active_seconds += i64::from(row.active_seconds);
        slot.active_minutes += 1;
    }

    hours.retain(|slot| slot.active_minutes > 0);
    hours
}

/// Local-midnight bounds `[start, end)` of `date` as unix seconds.
pub fn day_bounds(date: NaiveDate) -> Option<(i64, i64)> {
    let start = local_midnight(date)?;
    let end = local_midnight(date.succ_opt()?)?;
    Some((start, end))
}

fn local_midnight(date: NaiveDate) -> Option<i64> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.timestamp()),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.timestamp()),
        LocalResult::None => None,
    }
}

pub fn local_datetime(ts: i64) -> Option<DateTime<Local>> {
    Local.timestamp_opt(ts, 0).single()
}

pub fn format_minute(ts: i64) -> String {
    local_datetime(ts)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}
