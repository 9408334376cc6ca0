//! lxcache page cache.
//!
//! - **Engine**: hash-sharded files framed with an expiry header
//! - **Meta store**: staleness markers that suppress reads (soft purge)
//! - **Repository**: the per-request façade over both
//! - **Drop-in**: the early reader that answers hits before the origin runs
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! directory = "/var/cache/lxcache"
//! default_ttl_seconds = 86400
//! mode = "self_hosted"
//! ```

mod config;
mod dropin;
mod engine;
mod meta;
mod middleware;
mod repository;

pub use config::{CacheConfig, default_blob_path};
pub use dropin::{Dropin, DropinOutcome, DropinRequest, PassReason};
pub use engine::{CacheEngine, CacheError, Clock, DummyEngine, FileEngine};
pub use meta::{CacheMetaStore, LAST_MODIFIED, MetaFields, format_last_modified, parse_last_modified};
pub use middleware::{CACHE_STATUS_HEADER, CacheState, edge_cache_layer};
pub use repository::{CacheRepository, CacheService, PurgeKey, stale_since};
