//! Hash-sharded storage paths.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Subdirectory of the cache root holding rendered pages.
pub const CONTENT_NAMESPACE: &str = "page";
/// Subdirectory of the cache root holding staleness markers.
pub const META_NAMESPACE: &str = "meta";

/// Lower-case hex SHA-256 of a key string.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// `dir/<last char>/<two chars before it>/<hash>`.
pub fn shard_path(dir: &Path, key: &str) -> PathBuf {
    shard_hashed(dir, &hash_key(key))
}

/// Two-level layout for an already-hashed name (at least three characters).
pub fn shard_hashed(dir: &Path, hash: &str) -> PathBuf {
    let len = hash.len();
    if len < 3 {
        return dir.join(hash);
    }
    dir.join(&hash[len - 1..])
        .join(&hash[len - 3..len - 1])
        .join(hash)
}
