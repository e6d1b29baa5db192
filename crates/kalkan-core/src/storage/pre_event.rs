use alloc::collections::VecDeque;
use core::mem::size_of;

use log::info;

use crate::config::StorageConfig;
use crate::metrics::SensorMetrics;

/// One persisted record as kept in RAM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogEntry {
    pub timestamp_ms: i64,
    pub metrics: SensorMetrics,
}

impl From<SensorMetrics> for LogEntry {
    fn from(metrics: SensorMetrics) -> Self {
        Self {
            timestamp_ms: metrics.timestamp_ms,
            metrics,
        }
    }
}

/// Bounded history of recent records, oldest dropped first.
///
/// Backfills event files with what happened before the trigger. Lost on power
/// cycle; the card is the durable copy.
pub struct PreEventBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl PreEventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Twenty minutes of rows at the logging interval, but never more than
    /// half of `memory_budget_bytes`.
    pub fn sized_for(config: &StorageConfig, memory_budget_bytes: usize) -> Self {
        let wanted = config.pre_event_entries();
        let affordable = (memory_budget_bytes / 2) / size_of::<LogEntry>();
        let capacity = wanted.min(affordable).max(1);
        if capacity < wanted {
            info!(
                "pre-event buffer limited to {} entries by memory (wanted {})",
                capacity, wanted
            );
        }
        Self::new(capacity)
    }

    /// Append an entry, returns true when the oldest one had to go.
    pub fn push(&mut self, entry: LogEntry) -> bool {
        let mut dropped = false;
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
            dropped = true;
        }
        self.entries.push_back(entry);
        dropped
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
