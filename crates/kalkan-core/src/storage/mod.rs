//! Durable storage of metrics on a removable volume
//!
//! - [`csv`]: row and header encoding shared by daily and event files
//! - [`pre_event`]: bounded in-RAM history used to backfill event files
//! - [`reclaim`]: free-space policy trimming the oldest daily files
//! - [`manager`]: the persistence state machine (mount retry, rollover,
//!   events, safe removal)
//! - [`sd_card`]: the embedded-sdmmc backend (feature `sdmmc`)

pub mod csv;
pub mod manager;
pub mod pre_event;
pub mod reclaim;
#[cfg(feature = "sdmmc")]
pub mod sd_card;

#[cfg(test)]
pub(crate) mod mem_volume;

use alloc::string::String;
use alloc::vec::Vec;

use thiserror_no_std::Error;

pub use csv::CsvSchema;
pub use manager::PersistenceManager;
pub use pre_event::{LogEntry, PreEventBuffer};

/// Storage faults. All are recoverable by retry or reclamation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFault {
    #[error("Volume could not be mounted")]
    MountFailed,
    #[error("Directory could not be created")]
    DirectoryCreation,
    #[error("Write to an open file failed")]
    WriteFailed,
    #[error("Read from a file failed")]
    ReadFailed,
    #[error("Free space below threshold and nothing left to reclaim")]
    LowSpace,
    #[error("Card removed")]
    Removed,
}

/// Persistence state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageState {
    #[default]
    Unmounted,
    Mounted,
    /// Removal asked for; files are being flushed and the bus powered down
    SafeRemovalRequested,
    /// Quiet period over, polling until the card is gone
    AwaitingPhysicalRemoval,
    /// Card seen absent, polling until it comes back
    AwaitingReinsertion,
}

impl StorageState {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Unmounted => "unmounted",
            Self::Mounted => "mounted",
            Self::SafeRemovalRequested => "removal requested",
            Self::AwaitingPhysicalRemoval => "remove card",
            Self::AwaitingReinsertion => "insert card",
        }
    }
}

/// What the UI gets to see of the persistence task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageStatus {
    pub state: StorageState,
    pub ready: bool,
    pub event_active: bool,
    pub awaiting_removal: bool,
    pub last_fault: Option<StorageFault>,
    pub rows_written: u32,
    /// Records accepted while nothing could be written durably
    pub rows_buffered_only: u32,
}

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create if missing, position at the end
    Append,
    /// Create if missing, discard existing contents
    Truncate,
    Read,
}

/// One file in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
}

/// A mountable filesystem reached through small copyable file handles.
///
/// Paths are absolute and use the long names of the file layout
/// (`/logs/2024-01-15.csv`); backends with shorter name limits translate.
pub trait Volume {
    type Error: core::fmt::Debug;
    type File: Copy + PartialEq + core::fmt::Debug;

    /// Bring up the bus and the filesystem. Also the card presence probe.
    fn mount(&mut self) -> Result<(), Self::Error>;
    /// Close everything and power the bus down. Never fails.
    fn unmount(&mut self);
    fn free_bytes(&mut self) -> Result<u64, Self::Error>;
    fn ensure_dir(&mut self, path: &str) -> Result<(), Self::Error>;
    /// Regular files directly inside `dir`
    fn list_files(&mut self, dir: &str) -> Result<Vec<DirEntry>, Self::Error>;

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Self::File, Self::Error>;
    fn file_len(&mut self, file: Self::File) -> Result<u64, Self::Error>;
    fn seek(&mut self, file: Self::File, offset: u64) -> Result<(), Self::Error>;
    /// Returns 0 at end of file
    fn read(&mut self, file: Self::File, buf: &mut [u8]) -> Result<usize, Self::Error>;
    fn write(&mut self, file: Self::File, data: &[u8]) -> Result<(), Self::Error>;
    fn flush(&mut self, file: Self::File) -> Result<(), Self::Error>;
    fn close(&mut self, file: Self::File) -> Result<(), Self::Error>;

    fn remove(&mut self, path: &str) -> Result<(), Self::Error>;
    /// Put `from` in place of `to`, removing `to` if present
    fn replace(&mut self, from: &str, to: &str) -> Result<(), Self::Error>;
}

/// Join a directory and a file name.
pub(crate) fn join(dir: &str, name: &str) -> String {
    let mut path = String::with_capacity(dir.len() + 1 + name.len());
    path.push_str(dir.trim_end_matches('/'));
    path.push('/');
    path.push_str(name);
    path
}
