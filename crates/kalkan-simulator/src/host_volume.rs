//! A [`Volume`] backed by a directory on the host file system.
//!
//! The directory plays the SD card. Capacity is simulated so reclamation can
//! be watched without filling the disk, and the card can be "pulled" from the
//! keyboard to walk through the safe-removal handshake.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use kalkan_core::storage::{DirEntry, OpenMode, Volume};

pub struct HostVolume {
    root: PathBuf,
    capacity: u64,
    present: bool,
    mounted: bool,
    files: HashMap<u32, File>,
    next_handle: u32,
}

impl HostVolume {
    pub fn new(root: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            root: root.into(),
            capacity,
            present: true,
            mounted: false,
            files: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Simulate pulling or inserting the card.
    pub fn set_present(&mut self, present: bool) {
        self.present = present;
        if !present {
            self.files.clear();
            self.mounted = false;
        }
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn check(&self) -> io::Result<()> {
        if !self.present {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no card"));
        }
        if !self.mounted {
            return Err(io::Error::other("not mounted"));
        }
        Ok(())
    }

    fn file(&mut self, handle: u32) -> io::Result<&mut File> {
        self.check()?;
        self.files
            .get_mut(&handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "stale handle"))
    }
}

fn used_bytes(dir: &Path) -> io::Result<u64> {
    let mut used = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        used += if meta.is_dir() {
            used_bytes(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(used)
}

impl Volume for HostVolume {
    type Error = io::Error;
    type File = u32;

    fn mount(&mut self) -> io::Result<()> {
        if !self.present {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no card"));
        }
        fs::create_dir_all(&self.root)?;
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) {
        for (_, file) in self.files.drain() {
            let _ = file.sync_all();
        }
        self.mounted = false;
    }

    fn free_bytes(&mut self) -> io::Result<u64> {
        self.check()?;
        Ok(self.capacity.saturating_sub(used_bytes(&self.root)?))
    }

    fn ensure_dir(&mut self, path: &str) -> io::Result<()> {
        self.check()?;
        fs::create_dir_all(self.host_path(path))
    }

    fn list_files(&mut self, dir: &str) -> io::Result<Vec<DirEntry>> {
        self.check()?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.host_path(dir))? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                entries.push(DirEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: meta.len(),
                });
            }
        }
        Ok(entries)
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> io::Result<u32> {
        self.check()?;
        let host = self.host_path(path);
        let file = match mode {
            OpenMode::Append => OpenOptions::new().create(true).append(true).read(true).open(host)?,
            OpenMode::Truncate => OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .read(true)
                .open(host)?,
            OpenMode::Read => File::open(host)?,
        };
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        self.files.insert(handle, file);
        Ok(handle)
    }

    fn file_len(&mut self, file: u32) -> io::Result<u64> {
        Ok(self.file(file)?.metadata()?.len())
    }

    fn seek(&mut self, file: u32, offset: u64) -> io::Result<()> {
        self.file(file)?.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn read(&mut self, file: u32, buf: &mut [u8]) -> io::Result<usize> {
        self.file(file)?.read(buf)
    }

    fn write(&mut self, file: u32, data: &[u8]) -> io::Result<()> {
        let capacity = self.capacity;
        let used = used_bytes(&self.root)?;
        if used + data.len() as u64 > capacity {
            return Err(io::Error::new(io::ErrorKind::StorageFull, "simulated card full"));
        }
        self.file(file)?.write_all(data)
    }

    fn flush(&mut self, file: u32) -> io::Result<()> {
        self.file(file)?.flush()
    }

    fn close(&mut self, file: u32) -> io::Result<()> {
        match self.files.remove(&file) {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        self.check()?;
        fs::remove_file(self.host_path(path))
    }

    fn replace(&mut self, from: &str, to: &str) -> io::Result<()> {
        self.check()?;
        fs::rename(self.host_path(from), self.host_path(to))
    }
}
