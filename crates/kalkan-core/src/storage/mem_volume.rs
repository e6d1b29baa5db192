//! In-memory [`Volume`] for tests: configurable capacity, card presence and
//! write-fault injection.

use std::collections::{BTreeMap, BTreeSet};
use std::string::{String, ToString};
use std::vec::Vec;

use super::{DirEntry, OpenMode, Volume};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemError {
    NoCard,
    NotMounted,
    NotFound,
    NoSpace,
    Injected,
}

pub(crate) struct MemVolume {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    pub capacity: u64,
    /// Card physically in the slot
    pub present: bool,
    pub fail_writes: bool,
    pub fail_flushes: bool,
    pub mount_attempts: u32,
    pub unmounts: u32,
    mounted: bool,
    open: BTreeMap<u32, (String, u64)>,
    next_handle: u32,
}

impl MemVolume {
    pub fn new(capacity: u64) -> Self {
        Self {
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            capacity,
            present: true,
            fail_writes: false,
            fail_flushes: false,
            mount_attempts: 0,
            unmounts: 0,
            mounted: false,
            open: BTreeMap::new(),
            next_handle: 1,
        }
    }

    pub fn with_file(mut self, path: &str, contents: Vec<u8>) -> Self {
        self.files.insert(path.to_string(), contents);
        self
    }

    pub fn used(&self) -> u64 {
        self.files.values().map(|f| f.len() as u64).sum()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn open_handles(&self) -> usize {
        self.open.len()
    }

    pub fn text(&self, path: &str) -> String {
        String::from_utf8_lossy(self.files.get(path).map(|f| f.as_slice()).unwrap_or(&[])).into_owned()
    }

    fn check(&self) -> Result<(), MemError> {
        if !self.present {
            return Err(MemError::NoCard);
        }
        if !self.mounted {
            return Err(MemError::NotMounted);
        }
        Ok(())
    }

    fn handle(&self, file: u32) -> Result<(String, u64), MemError> {
        self.open.get(&file).cloned().ok_or(MemError::NotFound)
    }
}

impl Volume for MemVolume {
    type Error = MemError;
    type File = u32;

    fn mount(&mut self) -> Result<(), MemError> {
        self.mount_attempts += 1;
        if !self.present {
            return Err(MemError::NoCard);
        }
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) {
        self.open.clear();
        self.mounted = false;
        self.unmounts += 1;
    }

    fn free_bytes(&mut self) -> Result<u64, MemError> {
        self.check()?;
        Ok(self.capacity.saturating_sub(self.used()))
    }

    fn ensure_dir(&mut self, path: &str) -> Result<(), MemError> {
        self.check()?;
        self.dirs.insert(path.to_string());
        Ok(())
    }

    fn list_files(&mut self, dir: &str) -> Result<Vec<DirEntry>, MemError> {
        self.check()?;
        let prefix = std::format!("{}/", dir.trim_end_matches('/'));
        Ok(self
            .files
            .iter()
            .filter_map(|(path, data)| {
                let name = path.strip_prefix(&prefix)?;
                (!name.contains('/')).then(|| DirEntry {
                    name: name.to_string(),
                    size: data.len() as u64,
                })
            })
            .collect())
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<u32, MemError> {
        self.check()?;
        let pos = match mode {
            OpenMode::Append => self.files.entry(path.to_string()).or_default().len() as u64,
            OpenMode::Truncate => {
                self.files.insert(path.to_string(), Vec::new());
                0
            }
            OpenMode::Read => {
                if !self.files.contains_key(path) {
                    return Err(MemError::NotFound);
                }
                0
            }
        };
        let handle = self.next_handle;
        self.next_handle += 1;
        self.open.insert(handle, (path.to_string(), pos));
        Ok(handle)
    }

    fn file_len(&mut self, file: u32) -> Result<u64, MemError> {
        self.check()?;
        let (path, _) = self.handle(file)?;
        Ok(self.files.get(&path).map(|f| f.len() as u64).unwrap_or(0))
    }

    fn seek(&mut self, file: u32, offset: u64) -> Result<(), MemError> {
        self.check()?;
        let entry = self.open.get_mut(&file).ok_or(MemError::NotFound)?;
        entry.1 = offset;
        Ok(())
    }

    fn read(&mut self, file: u32, buf: &mut [u8]) -> Result<usize, MemError> {
        self.check()?;
        let (path, pos) = self.handle(file)?;
        let data = self.files.get(&path).ok_or(MemError::NotFound)?;
        let start = (pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.open.insert(file, (path, pos + n as u64));
        Ok(n)
    }

    fn write(&mut self, file: u32, bytes: &[u8]) -> Result<(), MemError> {
        self.check()?;
        if self.fail_writes {
            return Err(MemError::Injected);
        }
        let (path, pos) = self.handle(file)?;
        let current = self.files.get(&path).map(|f| f.len() as u64).unwrap_or(0);
        let end = pos + bytes.len() as u64;
        let growth = end.saturating_sub(current);
        if self.used() + growth > self.capacity {
            return Err(MemError::NoSpace);
        }

        let data = self.files.entry(path.clone()).or_default();
        if data.len() < end as usize {
            data.resize(end as usize, 0);
        }
        data[pos as usize..end as usize].copy_from_slice(bytes);
        self.open.insert(file, (path, end));
        Ok(())
    }

    fn flush(&mut self, file: u32) -> Result<(), MemError> {
        self.check()?;
        if self.fail_flushes {
            return Err(MemError::Injected);
        }
        self.handle(file).map(|_| ())
    }

    fn close(&mut self, file: u32) -> Result<(), MemError> {
        self.open.remove(&file).map(|_| ()).ok_or(MemError::NotFound)
    }

    fn remove(&mut self, path: &str) -> Result<(), MemError> {
        self.check()?;
        self.files.remove(path).map(|_| ()).ok_or(MemError::NotFound)
    }

    fn replace(&mut self, from: &str, to: &str) -> Result<(), MemError> {
        self.check()?;
        let data = self.files.remove(from).ok_or(MemError::NotFound)?;
        self.files.insert(to.to_string(), data);
        Ok(())
    }
}
