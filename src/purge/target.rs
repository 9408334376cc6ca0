//! Typed purge targets.
//!
//! Raw purge requests carry their scope and flags as query markers
//! (`purge_all`, `canonical`, `deleted`). They are parsed once here; every
//! service downstream works with [`PurgeUrl`] and [`PurgeScope`].

use std::fmt;

use lxcache_core::{Device, page_url};
use url::Url;

use super::PurgeError;

pub const MARKER_PURGE_ALL: &str = "purge_all";
pub const MARKER_CANONICAL: &str = "canonical";
pub const MARKER_DELETED: &str = "deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PurgeScope {
    Single,
    AllForDomain,
    AllForDevice(Device),
}

impl PurgeScope {
    pub fn is_single(self) -> bool {
        matches!(self, PurgeScope::Single)
    }

    /// Whether entries rendered for `device` fall in this scope.
    pub fn covers(self, device: Device) -> bool {
        match self {
            PurgeScope::Single | PurgeScope::AllForDomain => true,
            PurgeScope::AllForDevice(target) => target == device,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PurgeUrl {
    url: Url,
    pub scope: PurgeScope,
    /// `None` when the request did not say which variant to drop.
    pub canonical: Option<bool>,
    /// The page is gone; no variant may survive as a soft purge.
    pub deleted: bool,
}

impl PurgeUrl {
    pub fn single(url: Url) -> Self {
        Self {
            url: strip(url),
            scope: PurgeScope::Single,
            canonical: None,
            deleted: false,
        }
    }

    pub fn all(url: Url, scope: PurgeScope) -> Self {
        let mut root = strip(url);
        root.set_path("/");
        root.set_query(None);
        Self {
            url: root,
            scope,
            canonical: None,
            deleted: false,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PurgeError> {
        let mut url =
            Url::parse(raw.trim()).map_err(|err| PurgeError::invalid_url(raw, err.to_string()))?;
        if url.host_str().is_none() {
            return Err(PurgeError::invalid_url(raw, "missing host"));
        }

        let mut scope = PurgeScope::Single;
        let mut canonical = None;
        let mut deleted = false;
        let mut marked = false;
        let mut kept = Vec::new();
        let query = url.query().map(str::to_string);
        let pairs = query.iter().flat_map(|query| query.split('&'));
        for pair in pairs.filter(|pair| !pair.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            match name {
                MARKER_PURGE_ALL => {
                    scope = match Device::parse(value) {
                        Some(device) => PurgeScope::AllForDevice(device),
                        None => PurgeScope::AllForDomain,
                    }
                }
                MARKER_CANONICAL => canonical = parse_flag(value),
                MARKER_DELETED => deleted = parse_flag(value).unwrap_or(true),
                _ => {
                    kept.push(pair);
                    continue;
                }
            }
            marked = true;
        }

        // Untouched queries keep their original encoding.
        if marked {
            let rest = kept.join("&");
            url.set_query((!rest.is_empty()).then_some(rest.as_str()));
        }

        let mut target = if scope.is_single() {
            Self::single(url)
        } else {
            Self::all(url, scope)
        };
        target.canonical = canonical;
        target.deleted = deleted;
        Ok(target)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Path plus query, as a server sees it in the request line.
    pub fn request_uri(&self) -> String {
        request_uri(&self.url)
    }

    /// The URL with and without a trailing slash; the root has one form.
    pub fn trailing_variants(&self) -> Vec<Url> {
        let path = self.url.path();
        if path == "/" || path.is_empty() {
            return vec![self.url.clone()];
        }
        let mut other = self.url.clone();
        match path.strip_suffix('/') {
            Some(trimmed) => other.set_path(trimmed),
            None => other.set_path(&format!("{path}/")),
        }
        vec![self.url.clone(), other]
    }
}

impl fmt::Display for PurgeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut url = self.url.clone();
        let scope = match self.scope {
            PurgeScope::Single => None,
            PurgeScope::AllForDomain => Some("1"),
            PurgeScope::AllForDevice(device) => Some(device.as_str()),
        };
        if scope.is_some() || self.canonical.is_some() || self.deleted {
            let mut pairs = url.query_pairs_mut();
            if let Some(scope) = scope {
                pairs.append_pair(MARKER_PURGE_ALL, scope);
            }
            if let Some(canonical) = self.canonical {
                pairs.append_pair(MARKER_CANONICAL, if canonical { "1" } else { "0" });
            }
            if self.deleted {
                pairs.append_pair(MARKER_DELETED, "1");
            }
        }
        f.write_str(url.as_str())
    }
}

/// Page URL as the file cache keys it.
pub(crate) fn key_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    page_url(url.scheme(), &authority, url.path(), url.query())
}

pub(crate) fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

fn strip(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "yes" | "" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
