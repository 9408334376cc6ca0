//! Shared building blocks for the lxcache hot path.
//!
//! Everything in this crate is linked into both the early-bootstrap drop-in
//! and the full request pipeline, so the two always agree on:
//!
//! - how a request maps to a cache key ([`key`]),
//! - which requests must never touch the cache ([`bypass`]),
//! - where a key lives on disk ([`path`]),
//! - how a cache file is framed and read ([`record`], [`io`]),
//! - how the exported configuration blob is encoded ([`blob`]).
//!
//! The crate carries no framework dependencies; it only needs the standard
//! library, a digest and a JSON codec.

pub mod blob;
pub mod bypass;
pub mod io;
pub mod key;
pub mod path;
pub mod record;

pub use blob::{BLOB_PREFIX, BlobError, ExportedOptions, IntegrationMode};
pub use bypass::{BypassReason, BypassRules};
pub use io::{Lookup, read_record, write_record};
pub use key::{CacheKey, Device, RequestProfile, is_mobile_user_agent, page_url, strip_query_params};
pub use path::{CONTENT_NAMESPACE, META_NAMESPACE, hash_key, shard_path};
pub use record::{HEADER_LEN, Record, RecordError, RecordHeader, RecordLayout};

/// Seconds since the Unix epoch, saturated into the on-disk `u32` width.
pub fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}
