//! Purge orchestration across the physical cache tiers.
//!
//! Each tier implements [`PurgeService`]: the CDN through its purge API,
//! the local reverse proxy through its key files, and the file cache
//! through the repository. [`PurgeCoordinator`] fans one URL list out to
//! whichever services are active.

mod cdn;
mod coordinator;
mod engine;
mod pending;
mod proxy;
mod target;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::infra::error::InfraError;

pub use cdn::{CdnPurgeConfig, CdnPurgeService, PurgeItem};
pub use coordinator::{PURGE_LOG_KEY, PURGE_LOG_LIMIT, PurgeCoordinator, PurgeReport, ServiceOutcome};
pub use engine::EnginePurgeService;
pub use pending::{PENDING_PURGE_KEY, PENDING_PURGE_TTL, PendingPurgeList};
pub use proxy::{ProxyCachePurgeService, proxy_cache_key};
pub use target::{PurgeScope, PurgeUrl};

#[derive(Debug, Error)]
pub enum PurgeError {
    #[error("purge request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("purge endpoint answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("no purge token available: {0}")]
    Token(#[source] InfraError),
    #[error("purge io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Transient(InfraError),
    #[error("invalid purge url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("{service} purge incomplete: {failed} of {total} entries failed")]
    Incomplete {
        service: &'static str,
        failed: usize,
        total: usize,
    },
}

impl PurgeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// One physical cache tier that can drop URLs.
#[async_trait]
pub trait PurgeService: Send + Sync {
    /// Stable label used in logs, metrics and reports.
    fn name(&self) -> &'static str;

    async fn clear(&self, urls: &[PurgeUrl]) -> Result<(), PurgeError>;
}
