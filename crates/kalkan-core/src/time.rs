//! Wall-clock helpers: civil dates for file rollover and ISO-8601 rendering

use alloc::format;
use alloc::string::String;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};

pub const LOG_DIR: &str = "/logs";
pub const EVENT_DIR: &str = "/events";

/// Monotonic and wall-clock time of one acquisition tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickTime {
    /// Free-running monotonic clock
    pub monotonic_us: u64,
    /// Milliseconds since the Unix epoch, as set by the time collaborator
    pub unix_ms: i64,
}

/// Source of [`TickTime`] for the task loops.
///
/// The firmware combines the embassy monotonic clock with the epoch offset
/// set by the time collaborator; tests and the simulator script it.
pub trait Clock {
    fn now(&self) -> TickTime;
}

impl TickTime {
    /// Monotonic time in milliseconds, the unit of all persistence timers.
    pub fn monotonic_ms(&self) -> u64 {
        self.monotonic_us / 1000
    }
}

/// Local civil time for `unix_ms` shifted by `utc_offset_secs`.
pub fn civil(unix_ms: i64, utc_offset_secs: i32) -> Option<NaiveDateTime> {
    let shifted = unix_ms.checked_add(utc_offset_secs as i64 * 1000)?;
    let secs = shifted.div_euclid(1000);
    let nanos = (shifted.rem_euclid(1000) * 1_000_000) as u32;
    DateTime::from_timestamp(secs, nanos).map(|dt| dt.naive_utc())
}

/// Calendar date keying the daily file. Out-of-range clocks map to the epoch.
pub fn log_date(unix_ms: i64, utc_offset_secs: i32) -> NaiveDate {
    civil(unix_ms, utc_offset_secs)
        .map(|dt| dt.date())
        .unwrap_or_default()
}

pub fn daily_log_path(date: NaiveDate) -> String {
    format!(
        "{}/{:04}-{:02}-{:02}.csv",
        LOG_DIR,
        date.year(),
        date.month(),
        date.day()
    )
}

pub fn event_path(unix_ms: i64, utc_offset_secs: i32) -> String {
    let dt = civil(unix_ms, utc_offset_secs).unwrap_or_default();
    format!(
        "{}/event_{:04}-{:02}-{:02}T{:02}-{:02}-{:02}.csv",
        EVENT_DIR,
        dt.year(),
        dt.month(),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second()
    )
}

/// `2024-01-15T08:30:00.250Z`, or with a `+hh:mm` suffix for a non-zero offset.
pub fn iso8601(unix_ms: i64, utc_offset_secs: i32) -> String {
    let dt = civil(unix_ms, utc_offset_secs).unwrap_or_default();
    let millis = dt.nanosecond() / 1_000_000;

    let mut out = format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}",
        dt.year(),
        dt.month(),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
        millis
    );
    if utc_offset_secs == 0 {
        out.push('Z');
    } else {
        let sign = if utc_offset_secs < 0 { '-' } else { '+' };
        let abs = utc_offset_secs.unsigned_abs();
        out.push_str(&format!("{}{:02}:{:02}", sign, abs / 3600, (abs % 3600) / 60));
    }
    out
}
