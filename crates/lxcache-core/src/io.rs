//! Locked record I/O.
//!
//! Every file access holds an advisory lock scoped to the open handle:
//! shared for reads, exclusive for writes. Locking is best effort; a
//! platform that refuses the lock still gets the read or write.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use crate::record::{Record, RecordHeader, RecordLayout};

/// Outcome of reading one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Missing,
    /// Header could not be decoded; the file should be removed.
    Corrupt,
    Expired(RecordHeader),
    Fresh(Record),
}

enum LockKind {
    Shared,
    Exclusive,
}

/// Releases the advisory lock when dropped, before the handle closes.
struct FileLockGuard<'a> {
    file: &'a File,
    held: bool,
}

impl<'a> FileLockGuard<'a> {
    fn acquire(file: &'a File, kind: LockKind) -> Self {
        let held = match kind {
            LockKind::Shared => file.lock_shared(),
            LockKind::Exclusive => file.lock(),
        }
        .is_ok();
        Self { file, held }
    }
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            let _ = self.file.unlock();
        }
    }
}

/// Read and classify the record at `path`.
pub fn read_record(path: &Path, layout: RecordLayout, now: u32) -> io::Result<Lookup> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Lookup::Missing),
        Err(err) => return Err(err),
    };

    let mut bytes = Vec::new();
    {
        let _guard = FileLockGuard::acquire(&file, LockKind::Shared);
        (&file).read_to_end(&mut bytes)?;
    }

    let record = match Record::split(layout, bytes) {
        Ok(record) => record,
        Err(_) => return Ok(Lookup::Corrupt),
    };

    match record.header {
        Some(header) if header.is_expired(now) => Ok(Lookup::Expired(header)),
        _ => Ok(Lookup::Fresh(record)),
    }
}

/// Replace the record at `path`, creating shard directories as needed.
pub fn write_record(
    path: &Path,
    header: Option<RecordHeader>,
    payload: &[u8],
) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Truncate only once the exclusive lock is held so readers never see
    // a half-cleared file from a waiting writer.
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let _guard = FileLockGuard::acquire(&file, LockKind::Exclusive);
    file.set_len(0)?;

    let mut buffer = Vec::with_capacity(payload.len() + crate::record::HEADER_LEN);
    if let Some(header) = header {
        buffer.extend_from_slice(&header.encode());
    }
    buffer.extend_from_slice(payload);
    (&file).write_all(&buffer)?;
    (&file).flush()
}

/// Remove a record file. Returns `false` when nothing was there.
pub fn remove_record(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Run `f` with an exclusive lock on `path` held for the duration.
///
/// Used for read-merge-write cycles on shared state files.
pub fn with_exclusive_lock<T>(
    path: &Path,
    f: impl FnOnce(&mut File) -> io::Result<T>,
) -> io::Result<T> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let lock_handle = file.try_clone()?;
    let _guard = FileLockGuard::acquire(&lock_handle, LockKind::Exclusive);
    f(&mut file)
}
