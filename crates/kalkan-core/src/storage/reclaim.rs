//! Free-space reclamation over the daily log files
//!
//! Oldest files go first (file names sort by date). Large files are cut to
//! roughly their newer half, small ones are removed outright. The pass stops
//! as soon as free space is back above the threshold.

use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, info};

use super::csv::{CsvSchema, is_header};
use super::{OpenMode, Volume, join};
use crate::config::StorageConfig;
use crate::time::LOG_DIR;

const COPY_CHUNK: usize = 512;
/// Longest header line that is carried over from the trimmed file
const MAX_HEADER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Free space was already above the threshold
    Idle { free: u64 },
    Recovered { free: u64 },
    /// Something was reclaimed, another pass can reclaim more
    Progress { free: u64 },
    /// Nothing left that may be touched
    Exhausted { free: u64 },
}

/// Run one reclamation pass over `/logs`.
///
/// `protected` is the path of the daily file currently open for writing; it is
/// never trimmed or removed.
pub fn reclaim<V: Volume>(
    volume: &mut V,
    config: &StorageConfig,
    schema: CsvSchema,
    protected: Option<&str>,
) -> Result<ReclaimOutcome, V::Error> {
    let threshold = config.free_space_threshold_bytes;
    let mut free = volume.free_bytes()?;
    if free >= threshold {
        return Ok(ReclaimOutcome::Idle { free });
    }

    let mut candidates: Vec<_> = volume
        .list_files(LOG_DIR)?
        .into_iter()
        .filter(|entry| entry.name.ends_with(".csv"))
        .map(|entry| (join(LOG_DIR, &entry.name), entry.size))
        .filter(|(path, _)| Some(path.as_str()) != protected)
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    if candidates.is_empty() {
        return Ok(ReclaimOutcome::Exhausted { free });
    }

    info!(
        "reclaim: {} bytes free, below {}, {} candidate files",
        free,
        threshold,
        candidates.len()
    );

    for (path, size) in candidates {
        if size >= config.min_trim_bytes {
            let kept = trim_to_newer_half(volume, &path, schema)?;
            info!("reclaim: trimmed {} from {} to {} bytes", path, size, kept);
        } else {
            volume.remove(&path)?;
            info!("reclaim: removed {} ({} bytes)", path, size);
        }

        free = volume.free_bytes()?;
        if free >= threshold {
            return Ok(ReclaimOutcome::Recovered { free });
        }
    }

    debug!("reclaim: pass finished with {} bytes free", free);
    Ok(ReclaimOutcome::Progress { free })
}

/// Delete `.tmp` leftovers of trims cut short by a reset or a pulled card.
///
/// Returns how many were removed.
pub fn remove_stale_temps<V: Volume>(volume: &mut V) -> Result<usize, V::Error> {
    let stale: Vec<_> = volume
        .list_files(LOG_DIR)?
        .into_iter()
        .filter(|entry| entry.name.ends_with(".tmp"))
        .map(|entry| join(LOG_DIR, &entry.name))
        .collect();

    for path in &stale {
        volume.remove(path)?;
        info!("reclaim: removed stale {}", path);
    }
    Ok(stale.len())
}

/// Replace the `.csv` suffix with `.tmp`.
fn temp_path(path: &str) -> String {
    let stem = path.strip_suffix(".csv").unwrap_or(path);
    let mut tmp = String::with_capacity(stem.len() + 4);
    tmp.push_str(stem);
    tmp.push_str(".tmp");
    tmp
}

/// Rewrite `path` as its header plus everything after the first line break
/// past the midpoint. Returns the new length.
pub fn trim_to_newer_half<V: Volume>(
    volume: &mut V,
    path: &str,
    schema: CsvSchema,
) -> Result<u64, V::Error> {
    let tmp = temp_path(path);

    let src = volume.open(path, OpenMode::Read)?;
    let dst = match volume.open(&tmp, OpenMode::Truncate) {
        Ok(file) => file,
        Err(e) => {
            let _ = volume.close(src);
            return Err(e);
        }
    };

    let copied = copy_newer_half(volume, src, dst, schema);
    let _ = volume.close(src);
    let closed = volume.close(dst);

    match copied.and_then(|written| closed.map(|_| written)) {
        Ok(written) => {
            volume.replace(&tmp, path)?;
            Ok(written)
        }
        Err(e) => {
            let _ = volume.remove(&tmp);
            Err(e)
        }
    }
}

fn copy_newer_half<V: Volume>(
    volume: &mut V,
    src: V::File,
    dst: V::File,
    schema: CsvSchema,
) -> Result<u64, V::Error> {
    let len = volume.file_len(src)?;

    let header = read_header(volume, src)?.unwrap_or_else(|| schema.header().into_bytes());
    volume.write(dst, &header)?;
    let mut written = header.len() as u64;

    volume.seek(src, len / 2)?;
    let mut buf = [0u8; COPY_CHUNK];
    let mut aligned = false;
    loop {
        let n = volume.read(src, &mut buf)?;
        if n == 0 {
            break;
        }

        let mut chunk = &buf[..n];
        if !aligned {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    aligned = true;
                    chunk = &chunk[i + 1..];
                }
                None => continue,
            }
        }

        if !chunk.is_empty() {
            volume.write(dst, chunk)?;
            written += chunk.len() as u64;
        }
    }

    Ok(written)
}

/// First line of the file including its newline, if it is a CSV header.
fn read_header<V: Volume>(volume: &mut V, src: V::File) -> Result<Option<Vec<u8>>, V::Error> {
    volume.seek(src, 0)?;
    let mut line = Vec::new();
    let mut buf = [0u8; 128];

    while line.len() < MAX_HEADER {
        let n = volume.read(src, &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(i) = buf[..n].iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&buf[..=i]);
            return Ok(is_header(&line).then_some(line));
        }
        line.extend_from_slice(&buf[..n]);
    }
    Ok(None)
}
