//! [`Volume`] on an SPI SD card through embedded-sdmmc
//!
//! FAT here only knows 8.3 names and cannot rename, so the long names of the
//! file layout are mapped onto short ones and `replace` is a copy plus delete:
//!
//! | Layout path                              | On card                 |
//! |------------------------------------------|-------------------------|
//! | `/logs/2024-01-15.csv`                   | `LOGS/20240115.CSV`     |
//! | `/logs/2024-01-15.tmp`                   | `LOGS/20240115.TMP`     |
//! | `/events/event_2024-01-15T08-30-05.csv`  | `EVENTS/00S7ANM5.EVT`   |
//!
//! Event stems are the seconds of the event's civil time in base 36, so every
//! event second gets its own file.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use chrono::{DateTime, Datelike, NaiveDate, Timelike};
use embedded_sdmmc::{
    Mode, RawDirectory, RawFile, RawVolume, SdCard, SdCardError, TimeSource, Timestamp, VolumeIdx,
    VolumeManager,
};

use thiserror_no_std::Error;

use super::{DirEntry, OpenMode, Volume};
use crate::time::civil;

const COPY_CHUNK: usize = 512;
const MAX_OPEN_FILES: usize = 4;

#[derive(Error, Debug)]
pub enum SdError {
    #[error("SD card not mounted")]
    NotMounted,
    /// Path outside the `/logs` and `/events` layout
    #[error("path has no 8.3 mapping")]
    InvalidPath,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("filesystem error: {0:?}")]
    Fs(embedded_sdmmc::Error<SdCardError>),
}

impl From<embedded_sdmmc::Error<SdCardError>> for SdError {
    fn from(value: embedded_sdmmc::Error<SdCardError>) -> Self {
        Self::Fs(value)
    }
}

/// FAT timestamps from the device wall clock.
pub struct UnixClock<F: Fn() -> i64> {
    now_ms: F,
    utc_offset_secs: i32,
}

impl<F: Fn() -> i64> UnixClock<F> {
    pub fn new(now_ms: F, utc_offset_secs: i32) -> Self {
        Self {
            now_ms,
            utc_offset_secs,
        }
    }
}

impl<F: Fn() -> i64> TimeSource for UnixClock<F> {
    fn get_timestamp(&self) -> Timestamp {
        let dt = civil((self.now_ms)(), self.utc_offset_secs).unwrap_or_default();
        Timestamp {
            year_since_1970: (dt.year() - 1970).clamp(0, 255) as u8,
            zero_indexed_month: dt.month0() as u8,
            zero_indexed_day: dt.day0() as u8,
            hours: dt.hour() as u8,
            minutes: dt.minute() as u8,
            seconds: dt.second() as u8,
        }
    }
}

#[derive(Clone, Copy)]
struct Mounted {
    volume: RawVolume,
    root: RawDirectory,
    card_bytes: u64,
}

pub struct SdVolume<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    volume_mgr: VolumeManager<SdCard<S, D>, T, 4, MAX_OPEN_FILES, 1>,
    mounted: Option<Mounted>,
    open_files: heapless::Vec<RawFile, MAX_OPEN_FILES>,
}

impl<S, D, T> SdVolume<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    pub fn new(sd_card: SdCard<S, D>, ts: T) -> Self {
        Self {
            volume_mgr: VolumeManager::new(sd_card, ts),
            mounted: None,
            open_files: heapless::Vec::new(),
        }
    }

    fn root(&self) -> Result<RawDirectory, SdError> {
        self.mounted.map(|m| m.root).ok_or(SdError::NotMounted)
    }

    /// Run `f` on an opened subdirectory of the root, closing it afterwards.
    fn with_dir<R>(
        &mut self,
        dir: &str,
        f: impl FnOnce(&VolumeManager<SdCard<S, D>, T, 4, MAX_OPEN_FILES, 1>, RawDirectory) -> Result<R, SdError>,
    ) -> Result<R, SdError> {
        let root = self.root()?;
        let raw_dir = self.volume_mgr.open_dir(root, dir)?;
        let result = f(&self.volume_mgr, raw_dir);
        let closed = self.volume_mgr.close_dir(raw_dir);
        let value = result?;
        closed?;
        Ok(value)
    }

    fn used_bytes(&mut self, dir: &str) -> Result<u64, SdError> {
        self.with_dir(dir, |mgr, raw_dir| {
            let mut used = 0u64;
            mgr.iterate_dir(raw_dir, |entry| {
                if !entry.attributes.is_directory() {
                    used += entry.size as u64;
                }
            })?;
            Ok(used)
        })
    }

    fn forget(&mut self, file: RawFile) {
        if let Some(index) = self.open_files.iter().position(|f| *f == file) {
            self.open_files.swap_remove(index);
        }
    }
}

impl<S, D, T> Volume for SdVolume<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    type Error = SdError;
    type File = RawFile;

    fn mount(&mut self) -> Result<(), SdError> {
        if self.mounted.is_some() {
            return Ok(());
        }

        // Force a full card init so a swapped card is detected
        self.volume_mgr.device(|card| card.mark_card_uninit());

        let volume = self.volume_mgr.open_raw_volume(VolumeIdx(0))?;
        let root = match self.volume_mgr.open_root_dir(volume) {
            Ok(root) => root,
            Err(e) => {
                let _ = self.volume_mgr.close_volume(volume);
                return Err(e.into());
            }
        };
        let card_bytes = self
            .volume_mgr
            .device(|card| card.num_bytes())
            .map_err(|e| SdError::Fs(embedded_sdmmc::Error::DeviceError(e)))?;

        self.mounted = Some(Mounted {
            volume,
            root,
            card_bytes,
        });
        Ok(())
    }

    fn unmount(&mut self) {
        while let Some(file) = self.open_files.pop() {
            let _ = self.volume_mgr.close_file(file);
        }
        if let Some(mounted) = self.mounted.take() {
            let _ = self.volume_mgr.close_dir(mounted.root);
            let _ = self.volume_mgr.close_volume(mounted.volume);
        }
        self.volume_mgr.device(|card| card.mark_card_uninit());
    }

    /// Card capacity minus what the log layout occupies.
    fn free_bytes(&mut self) -> Result<u64, SdError> {
        let card_bytes = self.mounted.map(|m| m.card_bytes).ok_or(SdError::NotMounted)?;
        let used = self.used_bytes(LOG_DIR_SHORT)? + self.used_bytes(EVENT_DIR_SHORT)?;
        Ok(card_bytes.saturating_sub(used))
    }

    fn ensure_dir(&mut self, path: &str) -> Result<(), SdError> {
        let root = self.root()?;
        let name = short_dir(path).ok_or(SdError::InvalidPath)?;
        match self.volume_mgr.make_dir_in_dir(root, name) {
            Ok(()) | Err(embedded_sdmmc::Error::DirAlreadyExists) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_files(&mut self, dir: &str) -> Result<Vec<DirEntry>, SdError> {
        let short = short_dir(dir).ok_or(SdError::InvalidPath)?;
        self.with_dir(short, |mgr, raw_dir| {
            let mut entries = Vec::new();
            mgr.iterate_dir(raw_dir, |entry| {
                if !entry.attributes.is_directory() {
                    entries.push(DirEntry {
                        name: long_name(entry.name.base_name(), entry.name.extension()),
                        size: entry.size as u64,
                    });
                }
            })?;
            Ok(entries)
        })
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<RawFile, SdError> {
        if self.open_files.is_full() {
            return Err(SdError::TooManyOpenFiles);
        }
        let (dir, name) = short_path(path).ok_or(SdError::InvalidPath)?;
        let mode = match mode {
            OpenMode::Append => Mode::ReadWriteCreateOrAppend,
            OpenMode::Truncate => Mode::ReadWriteCreateOrTruncate,
            OpenMode::Read => Mode::ReadOnly,
        };
        let file = self.with_dir(dir, |mgr, raw_dir| {
            Ok(mgr.open_file_in_dir(raw_dir, name.as_str(), mode)?)
        })?;
        let _ = self.open_files.push(file);
        Ok(file)
    }

    fn file_len(&mut self, file: RawFile) -> Result<u64, SdError> {
        Ok(self.volume_mgr.file_length(file)? as u64)
    }

    fn seek(&mut self, file: RawFile, offset: u64) -> Result<(), SdError> {
        let offset = u32::try_from(offset).unwrap_or(u32::MAX);
        Ok(self.volume_mgr.file_seek_from_start(file, offset)?)
    }

    fn read(&mut self, file: RawFile, buf: &mut [u8]) -> Result<usize, SdError> {
        if self.volume_mgr.file_eof(file)? {
            return Ok(0);
        }
        Ok(self.volume_mgr.read(file, buf)?)
    }

    fn write(&mut self, file: RawFile, data: &[u8]) -> Result<(), SdError> {
        Ok(self.volume_mgr.write(file, data)?)
    }

    fn flush(&mut self, file: RawFile) -> Result<(), SdError> {
        Ok(self.volume_mgr.flush_file(file)?)
    }

    fn close(&mut self, file: RawFile) -> Result<(), SdError> {
        self.forget(file);
        Ok(self.volume_mgr.close_file(file)?)
    }

    fn remove(&mut self, path: &str) -> Result<(), SdError> {
        let (dir, name) = short_path(path).ok_or(SdError::InvalidPath)?;
        self.with_dir(dir, |mgr, raw_dir| Ok(mgr.delete_file_in_dir(raw_dir, name.as_str())?))
    }

    fn replace(&mut self, from: &str, to: &str) -> Result<(), SdError> {
        let src = self.open(from, OpenMode::Read)?;
        let dst = match self.open(to, OpenMode::Truncate) {
            Ok(file) => file,
            Err(e) => {
                let _ = self.close(src);
                return Err(e);
            }
        };

        let mut buf = [0u8; COPY_CHUNK];
        let copied = loop {
            match self.read(src, &mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    if let Err(e) = self.write(dst, &buf[..n]) {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let _ = self.close(src);
        let closed = self.close(dst);
        copied?;
        closed?;
        self.remove(from)
    }
}

const LOG_DIR_SHORT: &str = "LOGS";
const EVENT_DIR_SHORT: &str = "EVENTS";

fn short_dir(path: &str) -> Option<&'static str> {
    match path.trim_matches('/') {
        "logs" => Some(LOG_DIR_SHORT),
        "events" => Some(EVENT_DIR_SHORT),
        _ => None,
    }
}

/// Map a layout path to its directory and 8.3 file name.
fn short_path(path: &str) -> Option<(&'static str, heapless::String<12>)> {
    let (dir, name) = path.trim_start_matches('/').split_once('/')?;
    let dir = short_dir(dir)?;
    let (stem, ext) = name.rsplit_once('.')?;

    let mut short = heapless::String::<12>::new();
    if dir == LOG_DIR_SHORT {
        // 2024-01-15 -> 20240115
        let digits = stem.chars().filter(|c| c.is_ascii_digit());
        for c in digits.take(8) {
            short.push(c).ok()?;
        }
        if short.len() != 8 {
            return None;
        }
        short.push('.').ok()?;
        for c in ext.chars().take(3) {
            short.push(c.to_ascii_uppercase()).ok()?;
        }
    } else {
        // event_2024-01-15T08-30-05 -> seconds of that civil time in base 36
        let secs = event_seconds(stem)?;
        for c in base36(secs) {
            short.push(c).ok()?;
        }
        short.push_str(".EVT").ok()?;
    }
    Some((dir, short))
}

const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Civil time of an `event_YYYY-MM-DDTHH-MM-SS` stem as seconds since 1970.
fn event_seconds(stem: &str) -> Option<u32> {
    let mut digits = [0u32; 14];
    let mut len = 0;
    for c in stem.chars() {
        if let Some(d) = c.to_digit(10) {
            *digits.get_mut(len)? = d;
            len += 1;
        }
    }
    if len != 14 {
        return None;
    }
    let number = |range: core::ops::Range<usize>| digits[range].iter().fold(0u32, |acc, &d| acc * 10 + d);

    let dt = NaiveDate::from_ymd_opt(number(0..4) as i32, number(4..6), number(6..8))?.and_hms_opt(
        number(8..10),
        number(10..12),
        number(12..14),
    )?;
    u32::try_from(dt.and_utc().timestamp()).ok()
}

/// Eight upper-case base-36 digits; covers the whole `u32` range.
fn base36(mut value: u32) -> [char; 8] {
    let mut out = ['0'; 8];
    for slot in out.iter_mut().rev() {
        *slot = BASE36[(value % 36) as usize] as char;
        value /= 36;
    }
    out
}

fn from_base36(text: &str) -> Option<u32> {
    text.chars().try_fold(0u32, |acc, c| {
        let digit = c.to_digit(36)?;
        acc.checked_mul(36)?.checked_add(digit)
    })
}

/// Inverse of [`short_path`]; unknown names are lower-cased as is.
fn long_name(base: &[u8], ext: &[u8]) -> String {
    let base = core::str::from_utf8(base).unwrap_or("");
    let ext = core::str::from_utf8(ext).unwrap_or("");

    if ext.eq_ignore_ascii_case("EVT") {
        let stamped = from_base36(base).and_then(|secs| DateTime::from_timestamp(secs as i64, 0));
        if let Some(dt) = stamped {
            return format!(
                "event_{:04}-{:02}-{:02}T{:02}-{:02}-{:02}.csv",
                dt.year(),
                dt.month(),
                dt.day(),
                dt.hour(),
                dt.minute(),
                dt.second()
            );
        }
    }

    let mut out = String::with_capacity(16);
    if base.len() == 8 && base.bytes().all(|b| b.is_ascii_digit()) {
        out.push_str(&base[0..4]);
        out.push('-');
        out.push_str(&base[4..6]);
        out.push('-');
        out.push_str(&base[6..8]);
    } else {
        out.extend(base.chars().map(|c| c.to_ascii_lowercase()));
    }
    if !ext.is_empty() {
        out.push('.');
        out.extend(ext.chars().map(|c| c.to_ascii_lowercase()));
    }
    out
}
