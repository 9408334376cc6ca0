//! Early-bootstrap cache reader.
//!
//! Runs before any origin work. It only needs the exported options blob
//! and the cache tree on disk, and it never fails: every error becomes a
//! passthrough so the request continues to the origin untouched.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use lxcache_core::bypass::{LOGGED_IN_COOKIE_PREFIX, cookie_prefix_present};
use lxcache_core::{
    BypassReason, BypassRules, CONTENT_NAMESPACE, CacheKey, ExportedOptions, IntegrationMode,
    RecordLayout, RequestProfile, page_url,
};
use tracing::debug;

use super::engine::{CacheEngine, FileEngine};
use super::meta::CacheMetaStore;

/// Request facts the drop-in looks at.
#[derive(Debug, Clone, Copy)]
pub struct DropinRequest<'a> {
    pub method: &'a str,
    pub scheme: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub user_agent: &'a str,
    pub cookie: Option<&'a str>,
}

impl DropinRequest<'_> {
    pub fn url(&self) -> String {
        page_url(self.scheme, self.host, self.path, self.query)
    }

    pub fn profile(&self) -> RequestProfile {
        RequestProfile::detect(self.url(), self.user_agent, self.query)
    }

    pub fn bypass(&self) -> Option<BypassReason> {
        BypassRules.check(self.method, self.path, self.query, self.cookie)
    }
}

/// Why a request went on to the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    Bypass(BypassReason),
    ConfigUnavailable,
    Disabled,
    LoggedIn,
    NotEligible,
    DnsMode,
    SoftPurged,
    CustomLogin,
    Miss,
    Error,
}

impl PassReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PassReason::Bypass(reason) => reason.as_str(),
            PassReason::ConfigUnavailable => "config",
            PassReason::Disabled => "disabled",
            PassReason::LoggedIn => "logged_in",
            PassReason::NotEligible => "not_eligible",
            PassReason::DnsMode => "dns_mode",
            PassReason::SoftPurged => "soft_purged",
            PassReason::CustomLogin => "custom_login",
            PassReason::Miss => "miss",
            PassReason::Error => "error",
        }
    }

    /// Passthroughs whose origin response may be written back.
    pub fn is_storable(self) -> bool {
        matches!(self, PassReason::Miss | PassReason::SoftPurged)
    }
}

impl fmt::Display for PassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropinOutcome {
    Hit { body: Bytes, key: CacheKey },
    Passthrough { reason: PassReason, do_not_cache: bool },
}

impl DropinOutcome {
    fn pass(reason: PassReason) -> Self {
        Self::Passthrough {
            reason,
            do_not_cache: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dropin {
    blob_path: PathBuf,
}

impl Dropin {
    pub fn new(blob_path: impl Into<PathBuf>) -> Self {
        Self {
            blob_path: blob_path.into(),
        }
    }

    pub fn handle(&self, request: &DropinRequest<'_>) -> DropinOutcome {
        let outcome = self.evaluate(request);
        match &outcome {
            DropinOutcome::Hit { key, .. } => {
                debug!(op = "dropin", result = "hit", key = %key, "serving cached page");
            }
            DropinOutcome::Passthrough { reason, .. } => {
                debug!(op = "dropin", result = "passthrough", reason = %reason, path = request.path);
            }
        }
        outcome
    }

    fn evaluate(&self, request: &DropinRequest<'_>) -> DropinOutcome {
        if let Some(reason) = request.bypass() {
            return DropinOutcome::pass(PassReason::Bypass(reason));
        }

        let Some(options) = self.load_options() else {
            return DropinOutcome::pass(PassReason::ConfigUnavailable);
        };
        if !options.cache_enabled() {
            return DropinOutcome::pass(PassReason::Disabled);
        }
        let Some(cache_dir) = options.cache_dir() else {
            return DropinOutcome::pass(PassReason::ConfigUnavailable);
        };

        if request
            .cookie
            .is_some_and(|cookie| cookie_prefix_present(cookie, LOGGED_IN_COOKIE_PREFIX))
        {
            return DropinOutcome::pass(PassReason::LoggedIn);
        }
        let profile = request.profile();
        if !profile.prism {
            return DropinOutcome::pass(PassReason::NotEligible);
        }
        if options.mode() != IntegrationMode::SelfHosted {
            return DropinOutcome::pass(PassReason::DnsMode);
        }

        let key = profile.key();
        let rendered = key.to_string();
        match CacheMetaStore::new(&cache_dir).is_stale(&rendered) {
            Ok(false) => {}
            Ok(true) => return DropinOutcome::pass(PassReason::SoftPurged),
            Err(_) => return DropinOutcome::pass(PassReason::Error),
        }

        if options
            .custom_login_path()
            .is_some_and(|login| matches_login_path(request.path, login))
        {
            return DropinOutcome::Passthrough {
                reason: PassReason::CustomLogin,
                do_not_cache: true,
            };
        }

        let ttl = Duration::from_secs(options.default_ttl().map(u64::from).unwrap_or_default());
        let engine = FileEngine::new(&cache_dir, CONTENT_NAMESPACE, RecordLayout::Expiring, ttl);
        match engine.get(&rendered) {
            Ok(Some(body)) => DropinOutcome::Hit { body, key },
            Ok(None) => DropinOutcome::pass(PassReason::Miss),
            Err(_) => DropinOutcome::pass(PassReason::Error),
        }
    }

    fn load_options(&self) -> Option<ExportedOptions> {
        let bytes = fs::read(&self.blob_path).ok()?;
        ExportedOptions::decode(&bytes).ok()
    }
}

fn matches_login_path(path: &str, login: &str) -> bool {
    let login = login.trim_end_matches('/');
    !login.is_empty() && path.trim_end_matches('/') == login
}
