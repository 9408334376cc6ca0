//! Local reverse-proxy cache purge.
//!
//! The proxy stores one file per cache key under
//! `root/<device>/<last hex>/<two hex before>/<md5>`, and its key encodes
//! scheme, host, request URI, device and canonical flag. A single page
//! therefore owns many slots; this service computes and removes all of
//! them, or drops the whole device tree for domain-wide purges.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lxcache_core::Device;
use lxcache_core::path::shard_hashed;
use md5::{Digest, Md5};
use tracing::{debug, instrument, warn};
use url::Url;

use super::target::{PurgeUrl, request_uri};
use super::{PurgeError, PurgeService};

const AMP_PREFIX: &str = "/amp";
const PAGED_MARKER: &str = "paged=1";

#[derive(Debug, Clone)]
pub struct ProxyCachePurgeService {
    roots: Vec<PathBuf>,
    devices: Vec<Device>,
}

/// Key string the proxy hashes for one slot.
pub fn proxy_cache_key(url: &Url, device: Device, canonical: bool) -> String {
    format!(
        "{}GET{}{}|{}|{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        request_uri(url),
        device.as_str(),
        u8::from(canonical)
    )
}

impl ProxyCachePurgeService {
    pub fn new(roots: Vec<PathBuf>, devices: Vec<Device>) -> Self {
        Self { roots, devices }
    }

    /// Every URL form the proxy may have stored for `target`.
    pub fn url_variants(target: &PurgeUrl) -> Vec<Url> {
        let mut variants = Vec::new();
        for base in target.trailing_variants() {
            for amp in [false, true] {
                let mut url = base.clone();
                if amp {
                    let path = url.path().to_string();
                    url.set_path(&format!("{AMP_PREFIX}{path}"));
                }
                for paged in [false, true] {
                    let mut url = url.clone();
                    if paged {
                        let query = match url.query() {
                            Some(query) if !query.is_empty() => format!("{query}&{PAGED_MARKER}"),
                            _ => PAGED_MARKER.to_string(),
                        };
                        url.set_query(Some(&query));
                    }
                    variants.push(url);
                }
            }
        }
        variants
    }

    /// Key files under `root` for one device.
    pub fn key_files(&self, target: &PurgeUrl, root: &Path, device: Device) -> Vec<PathBuf> {
        let canonical_flags = match target.canonical {
            Some(flag) => vec![flag],
            None => vec![false, true],
        };
        let device_root = root.join(device.as_str());
        let mut files = BTreeSet::new();
        for url in Self::url_variants(target) {
            for &canonical in &canonical_flags {
                let key = proxy_cache_key(&url, device, canonical);
                let hash = hex::encode(Md5::digest(key.as_bytes()));
                files.insert(shard_hashed(&device_root, &hash));
            }
        }
        files.into_iter().collect()
    }

    async fn remove_file(path: &Path) -> Result<bool, PurgeError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(PurgeError::io(path, err)),
        }
    }

    async fn remove_tree(path: &Path) -> Result<bool, PurgeError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(PurgeError::io(path, err)),
        }
    }
}

#[async_trait]
impl PurgeService for ProxyCachePurgeService {
    fn name(&self) -> &'static str {
        "proxy_cache"
    }

    #[instrument(skip_all, fields(urls = urls.len(), roots = self.roots.len()))]
    async fn clear(&self, urls: &[PurgeUrl]) -> Result<(), PurgeError> {
        let mut attempted = 0usize;
        let mut removed = 0usize;
        let mut first_error = None;
        let mut failed = 0usize;

        for target in urls {
            for root in &self.roots {
                for &device in &self.devices {
                    if !target.scope.covers(device) {
                        continue;
                    }
                    let outcomes = if target.scope.is_single() {
                        let mut outcomes = Vec::new();
                        for file in self.key_files(target, root, device) {
                            outcomes.push(Self::remove_file(&file).await);
                        }
                        outcomes
                    } else {
                        vec![Self::remove_tree(&root.join(device.as_str())).await]
                    };

                    for outcome in outcomes {
                        attempted += 1;
                        match outcome {
                            Ok(true) => removed += 1,
                            Ok(false) => {}
                            Err(err) => {
                                failed += 1;
                                warn!(op = "proxy_purge", result = "error", error = %err);
                                first_error.get_or_insert(err);
                            }
                        }
                    }
                }
            }
        }

        debug!(op = "proxy_purge", attempted, removed, failed, "proxy cache purge finished");
        match first_error {
            Some(err) if failed == attempted => Err(err),
            Some(_) => Err(PurgeError::Incomplete {
                service: "proxy_cache",
                failed,
                total: attempted,
            }),
            None => Ok(()),
        }
    }
}
