//! File-backed cache engines.
//!
//! Every engine error is advisory: call sites log it and carry on as if
//! the cache had missed. Nothing here is allowed to fail page delivery.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use lxcache_core::io::{Lookup, read_record, remove_record, write_record};
use lxcache_core::{RecordHeader, RecordLayout, shard_path, unix_now};
use thiserror::Error;
use tracing::debug;

/// Source of "now" for expiry decisions.
pub type Clock = fn() -> u32;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt cache record at {0}")]
    Corrupt(PathBuf),
}

impl CacheError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub trait CacheEngine: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Header of a fresh entry; `None` for misses and for persistent records.
    fn header(&self, key: &str) -> Result<Option<RecordHeader>, CacheError>;

    /// Store `value` unless a fresh entry already exists.
    fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool, CacheError>;

    /// Store `value`, overwriting whatever is there.
    fn replace(&self, key: &str, value: &[u8], ttl: Option<Duration>)
    -> Result<bool, CacheError>;

    fn purge(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove the whole namespace. Succeeds when there is nothing to remove.
    fn purge_all(&self) -> Result<bool, CacheError>;

    /// Bytes on disk for this namespace.
    fn size(&self) -> Result<u64, CacheError>;
}

/// One namespace of hash-sharded cache files.
#[derive(Debug, Clone)]
pub struct FileEngine {
    dir: PathBuf,
    layout: RecordLayout,
    default_ttl: Duration,
    clock: Clock,
}

impl FileEngine {
    pub fn new(
        root: &Path,
        namespace: &str,
        layout: RecordLayout,
        default_ttl: Duration,
    ) -> Self {
        Self {
            dir: root.join(namespace),
            layout,
            default_ttl,
            clock: unix_now,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        shard_path(&self.dir, key)
    }

    /// Read a fresh record, deleting expired and corrupt files on the way.
    fn lookup(&self, key: &str) -> Result<Option<lxcache_core::Record>, CacheError> {
        let path = self.path_for(key);
        match read_record(&path, self.layout, (self.clock)())
            .map_err(|err| CacheError::io(&path, err))?
        {
            Lookup::Missing => Ok(None),
            Lookup::Fresh(record) => Ok(Some(record)),
            Lookup::Expired(header) => {
                debug!(
                    op = "lookup",
                    result = "expired",
                    expires_at = header.expires_at,
                    path = %path.display(),
                    "removing expired cache record"
                );
                remove_record(&path).map_err(|err| CacheError::io(&path, err))?;
                Ok(None)
            }
            Lookup::Corrupt => {
                let _ = remove_record(&path);
                Err(CacheError::Corrupt(path))
            }
        }
    }

    fn write(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool, CacheError> {
        let path = self.path_for(key);
        let header = match self.layout {
            RecordLayout::Expiring => {
                let ttl = ttl.unwrap_or(self.default_ttl).as_secs();
                let ttl = u32::try_from(ttl).unwrap_or(u32::MAX);
                Some(RecordHeader::new((self.clock)(), ttl))
            }
            RecordLayout::Persistent => None,
        };
        write_record(&path, header, value).map_err(|err| CacheError::io(&path, err))?;
        Ok(true)
    }
}

impl CacheEngine for FileEngine {
    fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(self
            .lookup(key)?
            .map(|record| Bytes::from(record.payload)))
    }

    fn header(&self, key: &str) -> Result<Option<RecordHeader>, CacheError> {
        Ok(self.lookup(key)?.and_then(|record| record.header))
    }

    fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<bool, CacheError> {
        match self.lookup(key) {
            Ok(Some(_)) => Ok(false),
            Ok(None) | Err(CacheError::Corrupt(_)) => self.write(key, value, ttl),
            Err(err) => Err(err),
        }
    }

    fn replace(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        self.write(key, value, ttl)
    }

    fn purge(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.path_for(key);
        remove_record(&path).map_err(|err| CacheError::io(&path, err))
    }

    fn purge_all(&self) -> Result<bool, CacheError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(CacheError::io(&self.dir, err)),
        }
    }

    fn size(&self) -> Result<u64, CacheError> {
        dir_size(&self.dir)
    }
}

fn dir_size(root: &Path) -> Result<u64, CacheError> {
    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(CacheError::io(&dir, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|err| CacheError::io(&dir, err))?;
            let metadata = entry
                .metadata()
                .map_err(|err| CacheError::io(&entry.path(), err))?;
            if metadata.is_dir() {
                pending.push(entry.path());
            } else {
                total = total.saturating_add(metadata.len());
            }
        }
    }
    Ok(total)
}

/// Engine used when caching is off for a request: misses and drops writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyEngine;

impl CacheEngine for DummyEngine {
    fn get(&self, _key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(None)
    }

    fn header(&self, _key: &str) -> Result<Option<RecordHeader>, CacheError> {
        Ok(None)
    }

    fn add(&self, _key: &str, _value: &[u8], _ttl: Option<Duration>) -> Result<bool, CacheError> {
        Ok(false)
    }

    fn replace(
        &self,
        _key: &str,
        _value: &[u8],
        _ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        Ok(false)
    }

    fn purge(&self, _key: &str) -> Result<bool, CacheError> {
        Ok(false)
    }

    fn purge_all(&self) -> Result<bool, CacheError> {
        Ok(true)
    }

    fn size(&self) -> Result<u64, CacheError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use lxcache_core::CONTENT_NAMESPACE;
    use tempfile::TempDir;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn at_1000() -> u32 {
        1_000
    }

    fn at_5000() -> u32 {
        5_000
    }

    fn engine(dir: &TempDir) -> FileEngine {
        FileEngine::new(dir.path(), CONTENT_NAMESPACE, RecordLayout::Expiring, HOUR)
    }

    #[test]
    fn add_then_get_round_trips() {
        let dir = TempDir::new().expect("temp dir");
        let engine = engine(&dir);
        assert!(engine.add("k", b"<html>", None).expect("add"));
        assert_eq!(
            engine.get("k").expect("get"),
            Some(Bytes::from_static(b"<html>"))
        );
    }

    #[test]
    fn add_keeps_fresh_entry() {
        let dir = TempDir::new().expect("temp dir");
        let engine = engine(&dir);
        engine.add("k", b"first", None).expect("add");
        assert!(!engine.add("k", b"second", None).expect("add again"));
        assert_eq!(
            engine.get("k").expect("get"),
            Some(Bytes::from_static(b"first"))
        );

        engine.replace("k", b"second", None).expect("replace");
        assert_eq!(
            engine.get("k").expect("get"),
            Some(Bytes::from_static(b"second"))
        );
    }

    #[test]
    fn expired_entry_is_removed_on_read() {
        let dir = TempDir::new().expect("temp dir");
        let writer = engine(&dir).with_clock(at_1000);
        writer
            .add("k", b"body", Some(Duration::from_secs(60)))
            .expect("add");
        let path = writer.path_for("k");
        assert!(path.exists());

        let header = writer.header("k").expect("header").expect("fresh header");
        assert_eq!(header.created_at, 1_000);
        assert_eq!(header.expires_at, 1_060);

        let reader = engine(&dir).with_clock(at_5000);
        assert_eq!(reader.get("k").expect("get"), None);
        assert!(!path.exists());
    }

    #[test]
    fn truncated_entry_reads_as_corrupt_and_is_removed() {
        let dir = TempDir::new().expect("temp dir");
        let engine = engine(&dir);
        let path = engine.path_for("k");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, b"abc").expect("write");

        assert!(matches!(engine.get("k"), Err(CacheError::Corrupt(_))));
        assert!(!path.exists());
        assert!(engine.add("k", b"ok", None).expect("add over corrupt"));
    }

    #[test]
    fn purge_all_is_idempotent() {
        let dir = TempDir::new().expect("temp dir");
        let engine = engine(&dir);
        engine.add("a", b"1", None).expect("add");
        engine.add("b", b"2", None).expect("add");
        assert!(engine.purge_all().expect("first purge"));
        assert!(engine.purge_all().expect("second purge"));
        assert_eq!(engine.get("a").expect("get"), None);
    }

    #[test]
    fn size_counts_headers_and_payloads() {
        let dir = TempDir::new().expect("temp dir");
        let engine = engine(&dir);
        assert_eq!(engine.size().expect("size"), 0);
        engine.add("a", b"12345", None).expect("add");
        engine.add("b", b"123", None).expect("add");
        assert_eq!(engine.size().expect("size"), 8 + 5 + 8 + 3);
    }

    #[test]
    fn purge_reports_whether_a_file_existed() {
        let dir = TempDir::new().expect("temp dir");
        let engine = engine(&dir);
        engine.add("k", b"v", None).expect("add");
        assert!(engine.purge("k").expect("purge"));
        assert!(!engine.purge("k").expect("purge again"));
    }

    #[test]
    fn dummy_engine_never_stores() {
        let engine = DummyEngine;
        assert!(!engine.add("k", b"v", None).expect("add"));
        assert_eq!(engine.get("k").expect("get"), None);
        assert!(engine.purge_all().expect("purge all"));
        assert_eq!(engine.size().expect("size"), 0);
    }
}
