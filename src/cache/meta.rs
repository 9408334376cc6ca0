//! Staleness markers kept apart from page content.
//!
//! A meta record for a key means "provisionally stale, defer to upstream":
//! readers skip the content even when the file is present and unexpired.
//! Records never expire on their own.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use lxcache_core::{META_NAMESPACE, RecordLayout};
use time::{OffsetDateTime, format_description::well_known::Rfc2822};

use super::engine::{CacheEngine, CacheError, FileEngine};

/// Field names to string values, serialized as one JSON object.
pub type MetaFields = BTreeMap<String, String>;

pub const LAST_MODIFIED: &str = "last-modified";

#[derive(Debug, Clone)]
pub struct CacheMetaStore {
    engine: FileEngine,
}

impl CacheMetaStore {
    pub fn new(root: &Path) -> Self {
        Self {
            engine: FileEngine::new(root, META_NAMESPACE, RecordLayout::Persistent, Duration::ZERO),
        }
    }

    pub fn get(&self, key: &str) -> Result<MetaFields, CacheError> {
        let Some(bytes) = self.engine.get(key)? else {
            return Ok(MetaFields::new());
        };
        if bytes.is_empty() {
            return Ok(MetaFields::new());
        }
        serde_json::from_slice(&bytes).map_err(|_| CacheError::Corrupt(self.engine.path_for(key)))
    }

    /// True when a marker exists for `key`, whatever its fields.
    pub fn is_stale(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.engine.get(key)?.is_some())
    }

    /// Merge `fields` into the record for `key`, creating it if needed.
    /// Empty updates write nothing.
    pub fn update(&self, key: &str, fields: MetaFields) -> Result<bool, CacheError> {
        if fields.is_empty() {
            return Ok(false);
        }
        // A corrupt record is overwritten rather than merged.
        let mut merged = self.get(key).unwrap_or_default();
        merged.extend(fields);
        let payload = serde_json::to_vec(&merged)
            .map_err(|_| CacheError::Corrupt(self.engine.path_for(key)))?;
        self.engine.replace(key, &payload, None)
    }

    pub fn purge(&self, key: &str) -> Result<bool, CacheError> {
        self.engine.purge(key)
    }

    pub fn purge_all(&self) -> Result<bool, CacheError> {
        self.engine.purge_all()
    }

    pub fn size(&self) -> Result<u64, CacheError> {
        self.engine.size()
    }
}

/// RFC 2822 rendering of a Unix timestamp in UTC.
pub fn format_last_modified(epoch: u32) -> Option<String> {
    OffsetDateTime::from_unix_timestamp(i64::from(epoch))
        .ok()?
        .format(&Rfc2822)
        .ok()
}

pub fn parse_last_modified(value: &str) -> Option<u32> {
    let parsed = OffsetDateTime::parse(value, &Rfc2822).ok()?;
    u32::try_from(parsed.unix_timestamp()).ok()
}

/// Marker fields for a soft purge at `epoch`.
pub fn last_modified_fields(epoch: u32) -> MetaFields {
    let mut fields = MetaFields::new();
    if let Some(value) = format_last_modified(epoch) {
        fields.insert(LAST_MODIFIED.to_string(), value);
    }
    fields
}
