//! Flow sensor pulse capture
//!
//! The hall-effect flow sensor emits one rising edge per fixed volume. The
//! interrupt handler calls [`PulseCapture::on_edge`]; every other context only
//! ever sees a [`PulseSnapshot`] copied out under the same critical section.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

/// Number of recent inter-pulse periods kept for jitter diagnostics
pub const PERIOD_HISTORY: usize = 8;

#[derive(Debug, Clone, Copy)]
struct PulseState {
    total: u32,
    last_edge_us: u32,
    seen_edge: bool,
    last_period_us: u32,
    periods: [u32; PERIOD_HISTORY],
    head: usize,
    filled: usize,
}

impl PulseState {
    const fn new() -> Self {
        Self {
            total: 0,
            last_edge_us: 0,
            seen_edge: false,
            last_period_us: 0,
            periods: [0; PERIOD_HISTORY],
            head: 0,
            filled: 0,
        }
    }
}

/// Interrupt-shared pulse counter and period ring.
///
/// Intended to live in a `static` so the interrupt handler can reach it.
pub struct PulseCapture {
    state: Mutex<CriticalSectionRawMutex, Cell<PulseState>>,
}

impl PulseCapture {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(Cell::new(PulseState::new())),
        }
    }

    /// Record one rising edge at `now_us` (free-running microsecond clock).
    ///
    /// Interrupt context: no allocation, no logging, a handful of arithmetic
    /// operations inside the critical section.
    #[inline]
    pub fn on_edge(&self, now_us: u32) {
        self.state.lock(|cell| {
            let mut s = cell.get();
            s.total = s.total.wrapping_add(1);
            if s.seen_edge {
                let period = now_us.wrapping_sub(s.last_edge_us);
                s.last_period_us = period;
                s.periods[s.head] = period;
                s.head = (s.head + 1) % PERIOD_HISTORY;
                if s.filled < PERIOD_HISTORY {
                    s.filled += 1;
                }
            }
            s.last_edge_us = now_us;
            s.seen_edge = true;
            cell.set(s);
        });
    }

    /// Copy out a consistent view of the counter and the period ring.
    pub fn take_snapshot(&self) -> PulseSnapshot {
        let s = self.state.lock(|cell| cell.get());

        // Unroll the ring oldest-first outside the critical section
        let mut periods = [0u32; PERIOD_HISTORY];
        let start = (s.head + PERIOD_HISTORY - s.filled) % PERIOD_HISTORY;
        for (i, slot) in periods.iter_mut().take(s.filled).enumerate() {
            *slot = s.periods[(start + i) % PERIOD_HISTORY];
        }

        PulseSnapshot {
            total: s.total,
            last_period_us: s.last_period_us,
            last_edge_us: s.seen_edge.then_some(s.last_edge_us),
            periods,
            period_count: s.filled,
        }
    }

    /// Zero every field. Only call while the interrupt is detached.
    pub fn reset(&self) {
        self.state.lock(|cell| cell.set(PulseState::new()));
    }
}

impl Default for PulseCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the pulse state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseSnapshot {
    /// Pulses since boot or the last reset, wrapping at `u32::MAX`
    pub total: u32,
    pub last_period_us: u32,
    /// Timestamp of the newest edge, `None` before the first edge
    pub last_edge_us: Option<u32>,
    /// Recent periods, oldest first; only `period_count` entries are valid
    pub periods: [u32; PERIOD_HISTORY],
    pub period_count: usize,
}

impl PulseSnapshot {
    pub fn periods(&self) -> &[u32] {
        &self.periods[..self.period_count]
    }

    /// Pulses counted since `previous`, tolerant of counter wrap.
    pub fn pulses_since(&self, previous: &PulseSnapshot) -> u32 {
        self.total.wrapping_sub(previous.total)
    }

    pub fn jitter(&self) -> PulseJitter {
        PulseJitter::from_periods(self.periods())
    }
}

/// Spread of recent inter-pulse periods.
///
/// A healthy pump gives a steady pulse train; a rising coefficient of
/// variation points at cavitation, air or a failing impeller.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PulseJitter {
    pub mean_us: f32,
    pub median_us: f32,
    pub stddev_us: f32,
    /// `stddev / mean`, zero when there are no periods
    pub cv: f32,
    pub count: u8,
}

impl PulseJitter {
    pub fn from_periods(periods: &[u32]) -> Self {
        let n = periods.len().min(PERIOD_HISTORY);
        if n == 0 {
            return Self::default();
        }

        let mut sorted = [0u32; PERIOD_HISTORY];
        sorted[..n].copy_from_slice(&periods[..n]);
        sorted[..n].sort_unstable();
        let median = if n % 2 == 0 {
            (sorted[n / 2 - 1] as f32 + sorted[n / 2] as f32) / 2.0
        } else {
            sorted[n / 2] as f32
        };

        let mean = periods[..n].iter().map(|&p| p as f32).sum::<f32>() / n as f32;
        let variance = periods[..n]
            .iter()
            .map(|&p| {
                let d = p as f32 - mean;
                d * d
            })
            .sum::<f32>()
            / n as f32;
        let stddev = libm::sqrtf(variance);

        Self {
            mean_us: mean,
            median_us: median,
            stddev_us: stddev,
            cv: if mean > 0.0 { stddev / mean } else { 0.0 },
            count: n as u8,
        }
    }
}
