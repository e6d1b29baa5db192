//! Shared state between the acquisition task, the persistence task and the UI
//!
//! Everything here is safe to share through a `&'static` reference: single
//! value cells are guarded by a critical-section mutex, queues are bounded
//! embassy-sync channels.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use thiserror_no_std::Error;

use crate::config::{AcquisitionConfig, CalibrationFactors, Settings, StorageConfig};
use crate::metrics::SensorMetrics;
use crate::storage::StorageStatus;

/// Depth of the acquisition -> persistence queue
pub const METRICS_CHANNEL_CAPACITY: usize = 16;
/// Depth of each command queue
pub const COMMAND_CHANNEL_CAPACITY: usize = 4;

/// Single-slot "latest value" cell.
///
/// `store` overwrites, `load` copies the whole value out. Both run inside the
/// same critical section so a reader can see a stale value but never a torn one.
pub struct SnapshotCell<T: Copy> {
    inner: Mutex<CriticalSectionRawMutex, Cell<T>>,
}

impl<T: Copy> SnapshotCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Cell::new(value)),
        }
    }

    pub fn store(&self, value: T) {
        self.inner.lock(|cell| cell.set(value));
    }

    pub fn load(&self) -> T {
        self.inner.lock(|cell| cell.get())
    }

    /// Read-modify-write under one critical section, returns the new value.
    pub fn update(&self, f: impl FnOnce(T) -> T) -> T {
        self.inner.lock(|cell| {
            let next = f(cell.get());
            cell.set(next);
            next
        })
    }
}

/// Bounded queue that never blocks the producer.
///
/// When full, the oldest queued element is discarded to make room.
pub struct DropOldestChannel<T, const N: usize> {
    inner: Channel<CriticalSectionRawMutex, T, N>,
}

impl<T, const N: usize> DropOldestChannel<T, N> {
    pub const fn new() -> Self {
        Self {
            inner: Channel::new(),
        }
    }

    /// Enqueue `value`, returns how many old elements were dropped for it.
    pub fn publish(&self, value: T) -> usize {
        let mut pending = value;
        let mut dropped = 0;
        loop {
            match self.inner.try_send(pending) {
                Ok(()) => return dropped,
                Err(TrySendError::Full(value)) => {
                    if self.inner.try_receive().is_ok() {
                        dropped += 1;
                    }
                    pending = value;
                }
            }
        }
    }

    pub fn try_receive(&self) -> Option<T> {
        self.inner.try_receive().ok()
    }

    pub async fn receive(&self) -> T {
        self.inner.receive().await
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T, const N: usize> Default for DropOldestChannel<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

pub type MetricsChannel = DropOldestChannel<SensorMetrics, METRICS_CHANNEL_CAPACITY>;

/// Commands injected by the UI collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Start an event file with pre-trigger history
    TriggerEventSnapshot,
    /// True water column height in cm; the density ratio is derived from it
    SetCalibration(f32),
    /// Set the density ratio directly
    SetDensity(f32),
    PrepareForRemoval,
    Resume,
}

/// The subset of [`Command`] consumed by the acquisition task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquisitionCommand {
    CalibrateHeight(f32),
    SetDensity(f32),
}

/// The subset of [`Command`] consumed by the persistence task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageCommand {
    TriggerEvent,
    PrepareForRemoval,
    Resume,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Command queue full, command dropped")]
    CommandQueueFull,
}

/// Routes UI commands to the task that owns the affected state.
pub struct CommandBus {
    acquisition: Channel<CriticalSectionRawMutex, AcquisitionCommand, COMMAND_CHANNEL_CAPACITY>,
    storage: Channel<CriticalSectionRawMutex, StorageCommand, COMMAND_CHANNEL_CAPACITY>,
}

impl CommandBus {
    pub const fn new() -> Self {
        Self {
            acquisition: Channel::new(),
            storage: Channel::new(),
        }
    }

    /// Queue a command without blocking the caller.
    pub fn send(&self, command: Command) -> Result<(), AppError> {
        let sent = match command {
            Command::TriggerEventSnapshot => self.storage.try_send(StorageCommand::TriggerEvent).is_ok(),
            Command::PrepareForRemoval => self.storage.try_send(StorageCommand::PrepareForRemoval).is_ok(),
            Command::Resume => self.storage.try_send(StorageCommand::Resume).is_ok(),
            Command::SetCalibration(height_cm) => self
                .acquisition
                .try_send(AcquisitionCommand::CalibrateHeight(height_cm))
                .is_ok(),
            Command::SetDensity(ratio) => self
                .acquisition
                .try_send(AcquisitionCommand::SetDensity(ratio))
                .is_ok(),
        };

        if sent {
            Ok(())
        } else {
            Err(AppError::CommandQueueFull)
        }
    }

    pub fn try_acquisition(&self) -> Option<AcquisitionCommand> {
        self.acquisition.try_receive().ok()
    }

    pub fn try_storage(&self) -> Option<StorageCommand> {
        self.storage.try_receive().ok()
    }

    pub async fn next_storage(&self) -> StorageCommand {
        self.storage.receive().await
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the composition root shares between tasks and the UI.
///
/// The pulse capture is not part of it: the interrupt handler needs it in a
/// plain `static` before anything else is initialised.
pub struct SharedState {
    /// Newest metrics record, `None` until the first tick
    pub latest: SnapshotCell<Option<SensorMetrics>>,
    pub calibration: SnapshotCell<CalibrationFactors>,
    pub acquisition_config: SnapshotCell<AcquisitionConfig>,
    pub storage_config: SnapshotCell<StorageConfig>,
    pub storage_status: SnapshotCell<StorageStatus>,
    pub metrics: MetricsChannel,
    pub commands: CommandBus,
}

impl SharedState {
    pub fn new(settings: Settings) -> Self {
        let settings = settings.sanitized();
        Self {
            latest: SnapshotCell::new(None),
            calibration: SnapshotCell::new(settings.calibration),
            acquisition_config: SnapshotCell::new(settings.acquisition),
            storage_config: SnapshotCell::new(settings.storage),
            storage_status: SnapshotCell::new(StorageStatus::default()),
            metrics: MetricsChannel::new(),
            commands: CommandBus::new(),
        }
    }

    /// Current settings as one consistent bundle, for the key-value store.
    pub fn settings(&self) -> Settings {
        Settings {
            acquisition: self.acquisition_config.load(),
            calibration: self.calibration.load(),
            storage: self.storage_config.load(),
        }
    }
}
