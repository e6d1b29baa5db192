//! Monotonic and wall-clock time on the device

use embassy_time::Instant;
use kalkan_core::app_state::SnapshotCell;
use kalkan_core::time::{Clock, TickTime};

/// Milliseconds since the Unix epoch when this firmware was built
const BUILD_EPOCH_MS: i64 = parse_i64(env!("KALKAN_BUILD_EPOCH_MS"));

/// Offset of local time against UTC, from `.env` at build time
pub const UTC_OFFSET_SECS: i32 = parse_i64(env!("KALKAN_UTC_OFFSET_SECS")) as i32;

/// Unix time at monotonic zero. Starts at the build time; the time
/// collaborator corrects it through [`set_unix_time_ms`].
static EPOCH_AT_BOOT_MS: SnapshotCell<i64> = SnapshotCell::new(BUILD_EPOCH_MS);

const fn parse_i64(s: &str) -> i64 {
    let bytes = s.as_bytes();
    let (negative, mut i) = match bytes.first() {
        Some(b'-') => (true, 1),
        _ => (false, 0),
    };
    let mut value: i64 = 0;
    while i < bytes.len() {
        let digit = bytes[i];
        if digit < b'0' || digit > b'9' {
            break;
        }
        value = value * 10 + (digit - b'0') as i64;
        i += 1;
    }
    if negative { -value } else { value }
}

/// Align the wall clock to `unix_ms` as of now.
pub fn set_unix_time_ms(unix_ms: i64) {
    let since_boot = Instant::now().as_millis() as i64;
    EPOCH_AT_BOOT_MS.store(unix_ms - since_boot);
}

pub fn unix_time_ms() -> i64 {
    EPOCH_AT_BOOT_MS.load() + Instant::now().as_millis() as i64
}

/// [`Clock`] over the embassy time driver.
#[derive(Clone, Copy)]
pub struct FirmwareClock;

impl Clock for FirmwareClock {
    fn now(&self) -> TickTime {
        let now = Instant::now();
        TickTime {
            monotonic_us: now.as_micros(),
            unix_ms: EPOCH_AT_BOOT_MS.load() + now.as_millis() as i64,
        }
    }
}
