//! Durable, file-backed fallback queue.
//!
//! One newline-delimited text file per sink. Each line is one wire-ready
//! record. All file access goes through a mutex owned by the store instance,
//! never a global lock, so independent sinks do not contend.
//!
//! Size accounting is approximate: the store tracks the byte length it has
//! written rather than re-reading file metadata on every append. When an
//! append would push the file past the ceiling, the [`CeilingPolicy`]
//! decides whether old content is discarded or the new record is refused.
//!
//! A backing file belongs to one live store per process; opening a path that
//! another store still holds fails with [`StorageError::InUse`].

use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

// Canonical paths of stores open in this process.
static OPEN_STORES: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Default upper bound on the backing file size (10 MiB).
pub const DEFAULT_STORE_CEILING: u64 = 10 * 1024 * 1024;

/// What to sacrifice when the store reaches its ceiling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CeilingPolicy {
    /// Recreate the file, dropping everything stored so far.
    #[default]
    DiscardOldest,
    /// Keep the stored history and refuse the new record.
    RejectNewest,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("overflow store {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("overflow store {} reached its {ceiling}-byte ceiling", path.display())]
    CeilingReached { path: PathBuf, ceiling: u64 },
    #[error("record of {len} bytes exceeds the {ceiling}-byte store ceiling")]
    RecordTooLarge { len: u64, ceiling: u64 },
    #[error("overflow store {} is already open in this process", path.display())]
    InUse { path: PathBuf },
}

/// Append-only record log guarded by a per-instance lock.
#[derive(Debug)]
pub struct OverflowStore {
    path: PathBuf,
    ceiling: u64,
    policy: CeilingPolicy,
    // Approximate byte length of the backing file.
    size: Mutex<u64>,
    // Key in OPEN_STORES, released on drop.
    claim: PathBuf,
}

fn encode_line(record: &str) -> String {
    let mut line = record.trim_end_matches('\n').replace('\n', "\u{2028}");
    line.push('\n');
    line
}

impl OverflowStore {
    /// Open (creating if needed) the store backed by `path`.
    pub fn open(
        path: impl Into<PathBuf>,
        ceiling: u64,
        policy: CeilingPolicy,
    ) -> Result<Self, StorageError> {
        let path = path.into();
        let io_err = |source| StorageError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        let size = file.metadata().map_err(io_err)?.len();
        let claim = fs::canonicalize(&path).map_err(io_err)?;
        if !OPEN_STORES.lock().insert(claim.clone()) {
            return Err(StorageError::InUse { path });
        }
        debug!("overflow store {} opened with {size} bytes", path.display());
        Ok(Self {
            path,
            ceiling,
            policy,
            size: Mutex::new(size),
            claim,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Approximate number of bytes currently stored.
    pub fn size_bytes(&self) -> u64 {
        *self.size.lock()
    }

    pub fn has_records(&self) -> bool {
        self.size_bytes() > 0
    }

    fn io_error(&self, source: io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Append one record.
    pub fn put(&self, record: &str) -> Result<(), StorageError> {
        self.put_all(std::iter::once(record))
    }

    /// Append several records in order under a single lock acquisition.
    ///
    /// A record larger than the ceiling is skipped with a warning and the
    /// rest of the batch is still appended; the first such skip is then
    /// reported as [`StorageError::RecordTooLarge`].
    pub fn put_all<'a>(
        &self,
        records: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), StorageError> {
        let lines: Vec<String> = records.into_iter().map(encode_line).collect();
        if lines.is_empty() {
            return Ok(());
        }
        let mut size = self.size.lock();
        let mut skipped = None;
        for line in &lines {
            let len = line.len() as u64;
            if len > self.ceiling {
                warn!(
                    "overflow store {} skipped a {len}-byte record over its {}-byte ceiling",
                    self.path.display(),
                    self.ceiling
                );
                skipped.get_or_insert(StorageError::RecordTooLarge {
                    len,
                    ceiling: self.ceiling,
                });
                continue;
            }
            if *size + len > self.ceiling {
                match self.policy {
                    CeilingPolicy::DiscardOldest => {
                        warn!(
                            "overflow store {} reached {} bytes; discarding stored records",
                            self.path.display(),
                            self.ceiling
                        );
                        self.truncate_locked(&mut size)?;
                    }
                    CeilingPolicy::RejectNewest => {
                        return Err(StorageError::CeilingReached {
                            path: self.path.clone(),
                            ceiling: self.ceiling,
                        });
                    }
                }
            }
            self.append_locked(&mut size, line)?;
        }
        skipped.map_or(Ok(()), Err)
    }

    /// Read every stored record, oldest first.
    ///
    /// With `remove_after` the backing file is deleted once read; the next
    /// `put` recreates it.
    pub fn drain_all(&self, remove_after: bool) -> Result<Vec<String>, StorageError> {
        let mut size = self.size.lock();
        let records = self.read_locked()?;
        if remove_after {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(self.io_error(err)),
            }
            *size = 0;
        }
        Ok(records)
    }

    /// Put `records` back in front of whatever the store currently holds.
    ///
    /// Used when a drained batch could not be delivered: those records are
    /// older than anything appended since the drain.
    pub fn requeue_front(&self, records: Vec<String>) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut size = self.size.lock();
        let mut lines: Vec<String> = records.iter().map(|r| encode_line(r)).collect();
        lines.extend(self.read_locked()?.iter().map(|r| encode_line(r)));

        let mut total: u64 = lines.iter().map(|l| l.len() as u64).sum();
        let mut dropped = 0usize;
        while total > self.ceiling && !lines.is_empty() {
            let removed = match self.policy {
                CeilingPolicy::DiscardOldest => lines.remove(0),
                CeilingPolicy::RejectNewest => lines.pop().unwrap_or_default(),
            };
            total -= removed.len() as u64;
            dropped += 1;
        }
        if dropped > 0 {
            warn!(
                "overflow store {} over its {}-byte ceiling; dropped {dropped} records while requeueing",
                self.path.display(),
                self.ceiling
            );
        }

        let tmp = self.path.with_extension("requeue");
        let write = || -> io::Result<()> {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for line in &lines {
                writer.write_all(line.as_bytes())?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|err| self.io_error(err))?;
        *size = total;
        Ok(())
    }

    /// Clear the store and leave an empty backing file.
    pub fn recreate(&self) -> Result<(), StorageError> {
        let mut size = self.size.lock();
        self.truncate_locked(&mut size)
    }

    fn truncate_locked(&self, size: &mut MutexGuard<'_, u64>) -> Result<(), StorageError> {
        File::create(&self.path).map_err(|err| self.io_error(err))?;
        **size = 0;
        debug!("overflow store {} recreated", self.path.display());
        Ok(())
    }

    fn append_locked(&self, size: &mut MutexGuard<'_, u64>, line: &str) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| self.io_error(err))?;
        match file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
            Ok(()) => {
                **size += line.len() as u64;
                Ok(())
            }
            Err(err) => {
                // A partial write may have landed; resync from the file.
                if let Ok(meta) = file.metadata() {
                    **size = meta.len();
                }
                Err(self.io_error(err))
            }
        }
    }

    fn read_locked(&self) -> Result<Vec<String>, StorageError> {
        let mut bytes = Vec::new();
        match File::open(&self.path) {
            Ok(mut file) => {
                file.read_to_end(&mut bytes)
                    .map_err(|err| self.io_error(err))?;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.io_error(err)),
        }
        Ok(String::from_utf8_lossy(&bytes)
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }
}

impl Drop for OverflowStore {
    fn drop(&mut self) {
        OPEN_STORES.lock().remove(&self.claim);
    }
}
