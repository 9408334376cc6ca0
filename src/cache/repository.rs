//! Cache repository: the only owner of content and meta lifecycles.
//!
//! `CacheService` is built once at startup and shared. Each request asks it
//! for a `CacheRepository`, which fixes the engine for that request: the
//! real file engine, or the dummy when caching is off or the request
//! carries a bypass signal.
//!
//! Purges come in two flavours. A soft purge of a prism key writes a
//! `last-modified` meta marker and leaves the bytes on disk; readers skip
//! the entry until the next store clears the marker. A hard purge deletes
//! the marker and the content.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use lxcache_core::{
    BypassReason, CONTENT_NAMESPACE, CacheKey, RecordLayout, RequestProfile, unix_now,
};
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::engine::{CacheEngine, CacheError, Clock, DummyEngine, FileEngine};
use super::meta::{CacheMetaStore, LAST_MODIFIED, MetaFields, last_modified_fields};

/// What a purge call addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeKey<'a> {
    /// Page URL, keyed through the request profile.
    Url(&'a str),
    /// Already-rendered cache key.
    Raw(&'a str),
}

#[derive(Debug)]
pub struct CacheService {
    config: CacheConfig,
    content: FileEngine,
    dummy: DummyEngine,
    meta: CacheMetaStore,
    clock: Clock,
}

impl CacheService {
    pub fn new(config: CacheConfig) -> Self {
        let content = FileEngine::new(
            &config.directory,
            CONTENT_NAMESPACE,
            RecordLayout::Expiring,
            config.default_ttl,
        );
        let meta = CacheMetaStore::new(&config.directory);
        Self {
            config,
            content,
            dummy: DummyEngine,
            meta,
            clock: unix_now,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.content = self.content.with_clock(clock);
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Repository for one request; the engine choice is fixed here.
    pub fn for_request(
        &self,
        profile: RequestProfile,
        bypass: Option<BypassReason>,
    ) -> CacheRepository<'_> {
        let engine: &dyn CacheEngine = if self.config.enabled && bypass.is_none() {
            &self.content
        } else {
            &self.dummy
        };
        CacheRepository {
            service: self,
            engine,
            profile,
            bypass,
        }
    }

    /// Soft purge for prism keys unless `force`; hard purge otherwise.
    pub fn purge_key(&self, key: &CacheKey, force: bool) -> bool {
        let rendered = key.to_string();
        if key.prism && !force {
            return self.soft_purge(&rendered);
        }
        self.hard_purge(&rendered)
    }

    /// Purge by rendered key. Strings that do not parse as keys are hard
    /// purged verbatim.
    pub fn purge_raw(&self, raw: &str, force: bool) -> bool {
        match CacheKey::parse(raw) {
            Some(key) => self.purge_key(&key, force),
            None => self.hard_purge(raw),
        }
    }

    fn soft_purge(&self, key: &str) -> bool {
        let fields = last_modified_fields((self.clock)());
        match self.meta.update(key, fields) {
            Ok(done) => {
                debug!(op = "purge", mode = "soft", key, "marked cache entry stale");
                done
            }
            Err(err) => advisory(err, "purge", false),
        }
    }

    fn hard_purge(&self, key: &str) -> bool {
        let meta = self.meta.purge(key).map(|_| true);
        let content = self.content.purge(key).map(|_| true);
        debug!(op = "purge", mode = "hard", key, "removed cache entry");
        let meta = meta.unwrap_or_else(|err| advisory(err, "purge", false));
        let content = content.unwrap_or_else(|err| advisory(err, "purge", false));
        meta && content
    }

    pub fn purge_all(&self) -> bool {
        let content = self
            .content
            .purge_all()
            .unwrap_or_else(|err| advisory(err, "purge_all", false));
        let meta = self
            .meta
            .purge_all()
            .unwrap_or_else(|err| advisory(err, "purge_all", false));
        debug!(op = "purge_all", result = content && meta, "cleared cache namespaces");
        content && meta
    }

    pub fn cache_size(&self) -> u64 {
        let content = self
            .content
            .size()
            .unwrap_or_else(|err| advisory(err, "size", 0));
        let meta = self.meta.size().unwrap_or_else(|err| advisory(err, "size", 0));
        content.saturating_add(meta)
    }

    /// Compare an upstream modification time against the local entry.
    ///
    /// Newer upstream content leaves a marker carrying the upstream time;
    /// otherwise any marker is dropped because the local copy is current.
    pub fn reconcile(&self, key: &CacheKey, upstream_modified: u32) -> bool {
        let rendered = key.to_string();
        let header = self
            .content
            .header(&rendered)
            .unwrap_or_else(|err| advisory(err, "reconcile", None));
        match header {
            Some(header) if upstream_modified > header.created_at => {
                let fields = last_modified_fields(upstream_modified);
                self.meta
                    .update(&rendered, fields)
                    .unwrap_or_else(|err| advisory(err, "reconcile", false))
            }
            _ => self
                .meta
                .purge(&rendered)
                .map(|_| true)
                .unwrap_or_else(|err| advisory(err, "reconcile", false)),
        }
    }
}

/// Per-request view over the cache.
pub struct CacheRepository<'a> {
    service: &'a CacheService,
    engine: &'a dyn CacheEngine,
    profile: RequestProfile,
    bypass: Option<BypassReason>,
}

impl CacheRepository<'_> {
    pub fn profile(&self) -> &RequestProfile {
        &self.profile
    }

    pub fn bypass(&self) -> Option<BypassReason> {
        self.bypass
    }

    pub fn key(&self, url: &str) -> CacheKey {
        self.profile.key_for(url)
    }

    /// Soft-purged entries and bypassed requests read as misses.
    pub fn get(&self, url: &str) -> Option<Bytes> {
        if self.bypass.is_some() {
            return None;
        }
        let key = self.key(url).to_string();
        if self.is_stale(&key) {
            return None;
        }
        self.engine
            .get(&key)
            .unwrap_or_else(|err| advisory(err, "get", None))
    }

    /// Store a fresh render. A stale entry is overwritten and its marker
    /// cleared; otherwise an existing fresh entry wins.
    pub fn set(&self, url: &str, content: &[u8], ttl: Option<Duration>) -> bool {
        if self.bypass.is_some() || !self.service.config.enabled {
            return false;
        }
        let key = self.key(url).to_string();
        if self.is_stale(&key) {
            let stored = self
                .engine
                .replace(&key, content, ttl)
                .unwrap_or_else(|err| advisory(err, "set", false));
            if stored {
                if let Err(err) = self.service.meta.purge(&key) {
                    return advisory(err, "set", false);
                }
            }
            return stored;
        }
        self.engine
            .add(&key, content, ttl)
            .unwrap_or_else(|err| advisory(err, "set", false))
    }

    pub fn purge(&self, target: PurgeKey<'_>, force: bool) -> bool {
        match target {
            PurgeKey::Url(url) => self.service.purge_key(&self.key(url), force),
            PurgeKey::Raw(raw) => self.service.purge_raw(raw, force),
        }
    }

    pub fn purge_all(&self) -> bool {
        self.service.purge_all()
    }

    pub fn update_meta(&self, url: &str, fields: MetaFields) -> bool {
        self.service
            .meta
            .update(&self.key(url).to_string(), fields)
            .unwrap_or_else(|err| advisory(err, "update_meta", false))
    }

    pub fn get_cache_meta(&self, url: &str) -> MetaFields {
        self.service
            .meta
            .get(&self.key(url).to_string())
            .unwrap_or_else(|err| advisory(err, "get_cache_meta", MetaFields::new()))
    }

    pub fn purge_cache_meta(&self, url: &str) {
        if let Err(err) = self.service.meta.purge(&self.key(url).to_string()) {
            advisory(err, "purge_cache_meta", ());
        }
    }

    pub fn cache_size(&self) -> u64 {
        self.service.cache_size()
    }

    pub fn reconcile(&self, url: &str, upstream_modified: u32) -> bool {
        self.service.reconcile(&self.key(url), upstream_modified)
    }

    /// Meta read failures count as stale so a broken marker never serves
    /// content that may have been invalidated.
    fn is_stale(&self, key: &str) -> bool {
        self.service
            .meta
            .is_stale(key)
            .unwrap_or_else(|err| advisory(err, "meta", true))
    }
}

/// Log an advisory cache failure and substitute `fallback`.
fn advisory<T>(err: CacheError, op: &'static str, fallback: T) -> T {
    warn!(op, result = "error", error = %err, "cache operation degraded");
    fallback
}

/// `last-modified` marker value, if the key is soft-purged.
pub fn stale_since(fields: &MetaFields) -> Option<&str> {
    fields.get(LAST_MODIFIED).map(String::as_str)
}
