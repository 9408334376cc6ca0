//! File cache purge through the repository.

use std::sync::Arc;

use async_trait::async_trait;
use lxcache_core::CacheKey;
use tracing::{debug, instrument};

use crate::cache::CacheService;

use super::target::{PurgeUrl, key_url};
use super::{PurgeError, PurgeService};

const FLAG_COMBINATIONS: [(bool, bool); 4] =
    [(false, false), (false, true), (true, false), (true, true)];

pub struct EnginePurgeService {
    cache: Arc<CacheService>,
}

impl EnginePurgeService {
    pub fn new(cache: Arc<CacheService>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl PurgeService for EnginePurgeService {
    fn name(&self) -> &'static str {
        "engine"
    }

    /// Any domain or device scope empties the whole file cache. Single URLs
    /// are purged for every (mobile, prism) variant; prism variants get a
    /// soft purge unless the page was deleted.
    #[instrument(skip_all, fields(urls = urls.len()))]
    async fn clear(&self, urls: &[PurgeUrl]) -> Result<(), PurgeError> {
        if urls.iter().any(|target| !target.scope.is_single()) {
            return if self.cache.purge_all() {
                Ok(())
            } else {
                Err(PurgeError::Incomplete {
                    service: "engine",
                    failed: 1,
                    total: 1,
                })
            };
        }

        let mut total = 0usize;
        let mut failed = 0usize;
        for target in urls {
            for variant in target.trailing_variants() {
                for (mobile, prism) in FLAG_COMBINATIONS {
                    let key = CacheKey::new(key_url(&variant), mobile, prism);
                    total += 1;
                    if !self.cache.purge_key(&key, target.deleted) {
                        failed += 1;
                    }
                }
            }
        }
        debug!(op = "engine_purge", total, failed, "file cache purge finished");

        if failed == 0 {
            Ok(())
        } else {
            Err(PurgeError::Incomplete {
                service: "engine",
                failed,
                total,
            })
        }
    }
}
