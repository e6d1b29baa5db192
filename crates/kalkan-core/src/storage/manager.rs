use alloc::boxed::Box;
use alloc::string::String;

use chrono::NaiveDate;
use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};

use super::pre_event::{LogEntry, PreEventBuffer};
use super::reclaim::{ReclaimOutcome, reclaim, remove_stale_temps};
use super::{OpenMode, StorageFault, StorageState, StorageStatus, Volume};
use crate::app_state::StorageCommand;
use crate::config::StorageConfig;
use crate::metrics::SensorMetrics;
use crate::time::{EVENT_DIR, LOG_DIR, daily_log_path, event_path, log_date};

/// First backoff between mount attempts in `begin`, doubled after each failure
const BEGIN_BACKOFF_MS: u32 = 250;

/// Invoked once the card is usable again after a reinsertion or reconnect.
pub type SdReadyCallback = Box<dyn FnMut()>;

struct DailyLog<F> {
    date: NaiveDate,
    path: String,
    file: F,
}

struct ActiveEvent<F> {
    path: String,
    /// `None` while the volume is away; reopened on the next mirrored row
    file: Option<F>,
    ends_at_ms: u64,
}

/// Owns the storage volume and everything written to it
///
/// This task receives metrics from the acquisition task and:
/// 1. Writes one CSV row per logging interval to the daily file
/// 2. Mirrors rows into the active event file, backfilled from RAM history
/// 3. Keeps free space above the threshold by trimming old daily files
/// 4. Runs the safe-removal handshake and remounts after reinsertion
///
/// All methods take a monotonic `now_ms`; nothing here blocks except the
/// volume I/O itself and the backoff in [`PersistenceManager::begin`].
pub struct PersistenceManager<V: Volume> {
    volume: V,
    config: StorageConfig,
    state: StorageState,
    pre_event: PreEventBuffer,
    daily: Option<DailyLog<V::File>>,
    event: Option<ActiveEvent<V::File>>,
    event_pending: bool,
    ready_callback: Option<SdReadyCallback>,

    last_accepted_ms: Option<u64>,
    next_mount_attempt_ms: u64,
    removal_started_ms: u64,
    next_poll_ms: u64,
    next_space_check_ms: u64,

    mount_failure_logged: bool,
    low_space_logged: bool,
    last_fault: Option<StorageFault>,
    rows_written: u32,
    rows_buffered_only: u32,
}

impl<V: Volume> PersistenceManager<V> {
    pub fn new(volume: V, config: StorageConfig, pre_event: PreEventBuffer) -> Self {
        Self {
            volume,
            config: config.sanitized(),
            state: StorageState::Unmounted,
            pre_event,
            daily: None,
            event: None,
            event_pending: false,
            ready_callback: None,
            last_accepted_ms: None,
            next_mount_attempt_ms: 0,
            removal_started_ms: 0,
            next_poll_ms: 0,
            next_space_check_ms: 0,
            mount_failure_logged: false,
            low_space_logged: false,
            last_fault: None,
            rows_written: 0,
            rows_buffered_only: 0,
        }
    }

    pub fn set_ready_callback(&mut self, callback: SdReadyCallback) {
        self.ready_callback = Some(callback);
    }

    /// Mount with bounded retries and increasing backoff.
    ///
    /// Failure is not fatal: the manager keeps buffering and `service` keeps
    /// retrying at the configured interval.
    pub fn begin<D: DelayNs>(&mut self, delay: &mut D, now_ms: u64) -> bool {
        let attempts = self.config.begin_attempts.max(1);
        let mut backoff = BEGIN_BACKOFF_MS;

        for attempt in 1..=attempts {
            match self.volume.mount() {
                Ok(()) => {
                    info!("storage: mounted on attempt {}/{}", attempt, attempts);
                    return self.on_mounted(now_ms);
                }
                Err(e) => {
                    debug!("storage: mount attempt {}/{} failed: {:?}", attempt, attempts, e);
                    if attempt < attempts {
                        delay.delay_ms(backoff);
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }

        warn!("storage: no card after {} attempts, buffering in RAM", attempts);
        self.mount_failure_logged = true;
        self.last_fault = Some(StorageFault::MountFailed);
        self.next_mount_attempt_ms = now_ms + self.config.mount_retry_interval_ms as u64;
        false
    }

    /// Accept at most one record per logging interval.
    pub fn offer(&mut self, metrics: SensorMetrics, now_ms: u64) -> bool {
        if let Some(last) = self.last_accepted_ms
            && now_ms.saturating_sub(last) < self.config.logging_interval_ms as u64
        {
            return false;
        }
        self.last_accepted_ms = Some(now_ms);
        self.log_record(metrics, now_ms);
        true
    }

    /// Persist one record (no decimation).
    pub fn log_record(&mut self, metrics: SensorMetrics, now_ms: u64) {
        if self.state == StorageState::Mounted {
            let row = self
                .config
                .schema
                .format_row(&metrics, self.config.utc_offset_secs);

            match self.write_daily(metrics.timestamp_ms, &row) {
                Ok(()) => {
                    self.rows_written = self.rows_written.wrapping_add(1);
                    if let Err(fault) = self.mirror_event(&row) {
                        self.invalidate(fault, now_ms);
                    }
                }
                Err(fault) => self.invalidate(fault, now_ms),
            }
        } else {
            self.rows_buffered_only = self.rows_buffered_only.wrapping_add(1);
        }

        self.pre_event.push(LogEntry::from(metrics));

        if self.event_pending && self.state == StorageState::Mounted {
            self.start_event(metrics.timestamp_ms, now_ms);
        }

        if self.state == StorageState::Mounted && now_ms >= self.next_space_check_ms {
            self.enforce_free_space(now_ms);
        }
    }

    pub fn handle(&mut self, command: StorageCommand, now_ms: u64) {
        match command {
            StorageCommand::TriggerEvent => self.trigger_event(),
            StorageCommand::PrepareForRemoval => self.prepare_for_removal(now_ms),
            StorageCommand::Resume => self.resume(now_ms),
        }
    }

    /// Request an event file. It opens with the next accepted record, named
    /// after that record's timestamp and backfilled from the pre-event buffer.
    pub fn trigger_event(&mut self) {
        if self.event.is_some() || self.event_pending {
            debug!("storage: event already active, trigger ignored");
            return;
        }
        info!("storage: event triggered");
        self.event_pending = true;
    }

    /// Flush, close and unmount, then wait out the quiet period.
    ///
    /// Repeated calls keep the first call's timing.
    pub fn prepare_for_removal(&mut self, now_ms: u64) {
        match self.state {
            StorageState::SafeRemovalRequested
            | StorageState::AwaitingPhysicalRemoval
            | StorageState::AwaitingReinsertion => {
                debug!("storage: removal already in progress");
                return;
            }
            StorageState::Mounted => {
                self.close_files();
                self.volume.unmount();
            }
            StorageState::Unmounted => {}
        }

        self.removal_started_ms = now_ms;
        self.set_state(StorageState::SafeRemovalRequested);
    }

    /// Abandon a removal handshake and go back to normal mount retries.
    pub fn resume(&mut self, now_ms: u64) {
        match self.state {
            StorageState::SafeRemovalRequested
            | StorageState::AwaitingPhysicalRemoval
            | StorageState::AwaitingReinsertion => {
                self.volume.unmount();
                self.next_mount_attempt_ms = now_ms;
                self.set_state(StorageState::Unmounted);
            }
            StorageState::Mounted | StorageState::Unmounted => {}
        }
    }

    /// Periodic housekeeping: mount retry, removal polling, event expiry and
    /// flushing of open files.
    pub fn service(&mut self, now_ms: u64) {
        self.expire_event(now_ms);

        match self.state {
            StorageState::Unmounted => {
                if now_ms >= self.next_mount_attempt_ms {
                    self.retry_mount(now_ms);
                }
            }
            StorageState::Mounted => {
                if let Err(fault) = self.flush_files() {
                    self.invalidate(fault, now_ms);
                }
            }
            StorageState::SafeRemovalRequested => {
                // No probing at all while contacts settle
                if now_ms.saturating_sub(self.removal_started_ms) >= self.config.quiet_period_ms as u64 {
                    self.next_poll_ms = now_ms;
                    self.set_state(StorageState::AwaitingPhysicalRemoval);
                }
            }
            StorageState::AwaitingPhysicalRemoval => {
                if now_ms >= self.next_poll_ms {
                    self.next_poll_ms = now_ms + self.config.poll_interval_ms as u64;
                    match self.volume.mount() {
                        // Still there, keep the bus down until it is pulled
                        Ok(()) => self.volume.unmount(),
                        Err(_) => {
                            info!("storage: card removed");
                            self.last_fault = Some(StorageFault::Removed);
                            self.set_state(StorageState::AwaitingReinsertion);
                        }
                    }
                }
            }
            StorageState::AwaitingReinsertion => {
                if now_ms >= self.next_poll_ms {
                    self.next_poll_ms = now_ms + self.config.poll_interval_ms as u64;
                    if self.volume.mount().is_ok() {
                        info!("storage: card reinserted");
                        if self.on_mounted(now_ms) {
                            self.notify_ready();
                        }
                    }
                }
            }
        }
    }

    pub fn state(&self) -> StorageState {
        self.state
    }

    pub fn status(&self) -> StorageStatus {
        StorageStatus {
            state: self.state,
            ready: self.state == StorageState::Mounted,
            event_active: self.event.is_some(),
            awaiting_removal: matches!(
                self.state,
                StorageState::SafeRemovalRequested
                    | StorageState::AwaitingPhysicalRemoval
                    | StorageState::AwaitingReinsertion
            ),
            last_fault: self.last_fault,
            rows_written: self.rows_written,
            rows_buffered_only: self.rows_buffered_only,
        }
    }

    pub fn pre_event(&self) -> &PreEventBuffer {
        &self.pre_event
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn volume(&self) -> &V {
        &self.volume
    }

    pub fn volume_mut(&mut self) -> &mut V {
        &mut self.volume
    }

    fn set_state(&mut self, next: StorageState) {
        if next != self.state {
            info!("storage: {} -> {}", self.state.label(), next.label());
            self.state = next;
        }
    }

    /// Create the directory layout after a successful mount.
    fn on_mounted(&mut self, now_ms: u64) -> bool {
        for dir in [LOG_DIR, EVENT_DIR] {
            if let Err(e) = self.volume.ensure_dir(dir) {
                error!("storage: cannot create {}: {:?}", dir, e);
                self.volume.unmount();
                self.last_fault = Some(StorageFault::DirectoryCreation);
                self.next_mount_attempt_ms = now_ms + self.config.mount_retry_interval_ms as u64;
                self.set_state(StorageState::Unmounted);
                return false;
            }
        }

        if let Err(e) = remove_stale_temps(&mut self.volume) {
            warn!("storage: cannot clear stale temp files: {:?}", e);
        }

        self.mount_failure_logged = false;
        self.next_space_check_ms = now_ms;
        self.set_state(StorageState::Mounted);
        true
    }

    fn retry_mount(&mut self, now_ms: u64) {
        match self.volume.mount() {
            Ok(()) => {
                if self.on_mounted(now_ms) {
                    self.notify_ready();
                }
            }
            Err(e) => {
                if self.mount_failure_logged {
                    debug!("storage: mount retry failed: {:?}", e);
                } else {
                    warn!("storage: mount failed: {:?}", e);
                    self.mount_failure_logged = true;
                }
                self.last_fault = Some(StorageFault::MountFailed);
                self.next_mount_attempt_ms = now_ms + self.config.mount_retry_interval_ms as u64;
            }
        }
    }

    fn notify_ready(&mut self) {
        if let Some(callback) = self.ready_callback.as_mut() {
            callback();
        }
    }

    /// A failed operation on an open handle means the mount is gone.
    fn invalidate(&mut self, fault: StorageFault, now_ms: u64) {
        error!("storage: {}, dropping mount", fault);
        self.daily = None;
        if let Some(event) = self.event.as_mut() {
            event.file = None;
        }
        self.volume.unmount();
        self.last_fault = Some(fault);
        self.next_mount_attempt_ms = now_ms;
        self.set_state(StorageState::Unmounted);
    }

    fn write_daily(&mut self, timestamp_ms: i64, row: &str) -> Result<(), StorageFault> {
        let date = log_date(timestamp_ms, self.config.utc_offset_secs);

        if self.daily.as_ref().is_some_and(|daily| daily.date != date) {
            info!("storage: rolling over to {}", date);
            self.close_daily();
        }

        let file = match self.daily.as_ref() {
            Some(daily) => daily.file,
            None => {
                let path = daily_log_path(date);
                let file = self.open_with_header(&path)?;
                debug!("storage: daily file {} open", path);
                self.daily = Some(DailyLog { date, path, file });
                file
            }
        };

        self.volume.write(file, row.as_bytes()).map_err(|e| {
            error!("storage: daily write failed: {:?}", e);
            StorageFault::WriteFailed
        })
    }

    /// Open for append, writing the header only into an empty file.
    fn open_with_header(&mut self, path: &str) -> Result<V::File, StorageFault> {
        let file = self.volume.open(path, OpenMode::Append).map_err(|e| {
            error!("storage: cannot open {}: {:?}", path, e);
            StorageFault::WriteFailed
        })?;

        let len = self.volume.file_len(file).map_err(|e| {
            error!("storage: cannot stat {}: {:?}", path, e);
            StorageFault::ReadFailed
        })?;

        if len == 0 {
            let header = self.config.schema.header();
            self.volume.write(file, header.as_bytes()).map_err(|e| {
                error!("storage: header write to {} failed: {:?}", path, e);
                StorageFault::WriteFailed
            })?;
        }
        Ok(file)
    }

    fn mirror_event(&mut self, row: &str) -> Result<(), StorageFault> {
        let Some(path) = self.event.as_ref().map(|event| event.path.clone()) else {
            return Ok(());
        };

        let file = match self.event.as_ref().and_then(|event| event.file) {
            Some(file) => file,
            None => {
                let file = self.open_with_header(&path)?;
                if let Some(event) = self.event.as_mut() {
                    event.file = Some(file);
                }
                file
            }
        };

        self.volume.write(file, row.as_bytes()).map_err(|e| {
            error!("storage: event write failed: {:?}", e);
            StorageFault::WriteFailed
        })
    }

    fn start_event(&mut self, timestamp_ms: i64, now_ms: u64) {
        let path = event_path(timestamp_ms, self.config.utc_offset_secs);

        let file = match self.open_with_header(&path) {
            Ok(file) => file,
            Err(fault) => {
                self.invalidate(fault, now_ms);
                return;
            }
        };

        // Backfill oldest first; the buffer is kept for the next event
        let schema = self.config.schema;
        let offset = self.config.utc_offset_secs;
        let mut backfilled = 0usize;
        let mut failure = None;
        for entry in self.pre_event.iter() {
            let row = schema.format_row(&entry.metrics, offset);
            if let Err(e) = self.volume.write(file, row.as_bytes()) {
                failure = Some(e);
                break;
            }
            backfilled += 1;
        }
        if let Some(e) = failure {
            error!("storage: event backfill failed after {} rows: {:?}", backfilled, e);
            self.invalidate(StorageFault::WriteFailed, now_ms);
            return;
        }

        info!("storage: event {} started with {} buffered rows", path, backfilled);
        self.event = Some(ActiveEvent {
            path,
            file: Some(file),
            ends_at_ms: now_ms + self.config.event_duration_secs as u64 * 1000,
        });
        self.event_pending = false;
    }

    fn expire_event(&mut self, now_ms: u64) {
        let expired = self
            .event
            .as_ref()
            .is_some_and(|event| now_ms >= event.ends_at_ms);
        if !expired {
            return;
        }

        if let Some(event) = self.event.take() {
            if let Some(file) = event.file {
                release(&mut self.volume, file, &event.path);
            }
            info!("storage: event {} finished", event.path);
        }
    }

    fn flush_files(&mut self) -> Result<(), StorageFault> {
        let daily = self.daily.as_ref().map(|daily| daily.file);
        let event = self.event.as_ref().and_then(|event| event.file);

        for file in daily.into_iter().chain(event) {
            self.volume.flush(file).map_err(|e| {
                error!("storage: flush failed: {:?}", e);
                StorageFault::WriteFailed
            })?;
        }
        Ok(())
    }

    fn close_daily(&mut self) {
        if let Some(daily) = self.daily.take() {
            release(&mut self.volume, daily.file, &daily.path);
        }
    }

    /// Close every open handle; an active event keeps running and reopens later.
    fn close_files(&mut self) {
        self.close_daily();
        if let Some(event) = self.event.as_mut()
            && let Some(file) = event.file.take()
        {
            release(&mut self.volume, file, &event.path);
        }
    }

    fn enforce_free_space(&mut self, now_ms: u64) {
        self.next_space_check_ms = now_ms + self.config.space_check_interval_ms as u64;

        let protected = self.daily.as_ref().map(|daily| daily.path.as_str());
        match reclaim(&mut self.volume, &self.config, self.config.schema, protected) {
            Ok(ReclaimOutcome::Idle { .. }) | Ok(ReclaimOutcome::Recovered { .. }) => {
                if self.low_space_logged {
                    info!("storage: free space recovered");
                    self.low_space_logged = false;
                }
            }
            Ok(ReclaimOutcome::Progress { free }) => {
                debug!("storage: still low on space ({} bytes free)", free);
            }
            Ok(ReclaimOutcome::Exhausted { free }) => {
                if !self.low_space_logged {
                    warn!("storage: {} bytes free and nothing left to reclaim", free);
                    self.low_space_logged = true;
                }
                self.last_fault = Some(StorageFault::LowSpace);
            }
            Err(e) => {
                error!("storage: reclamation failed: {:?}", e);
                self.invalidate(StorageFault::ReadFailed, now_ms);
            }
        }
    }
}

/// Flush and close `file`. The handle is given up even when either step fails.
fn release<V: Volume>(volume: &mut V, file: V::File, path: &str) {
    if let Err(e) = volume.flush(file) {
        warn!("storage: flushing {} failed: {:?}", path, e);
    }
    if let Err(e) = volume.close(file) {
        warn!("storage: closing {} failed: {:?}", path, e);
    }
}
