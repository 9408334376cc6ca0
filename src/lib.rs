//! lxcache: an edge page cache for CMS origins.
//!
//! The crate is split along the request path:
//!
//! - [`cache`] stores rendered pages, tracks staleness and serves hits
//!   before the origin is consulted.
//! - [`purge`] invalidates the plugin cache, the local reverse-proxy cache
//!   and the CDN when content changes.
//! - [`config`] and [`infra`] carry settings, telemetry and the adapters
//!   for external collaborators (token issuer, transient storage, origin).

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
pub mod purge;
