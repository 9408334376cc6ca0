//! Universal cache-bypass rules.

use std::fmt;

use crate::key::has_query_param;

/// Query parameters that switch the cache off for a single request.
pub const BYPASS_PARAMS: [&str; 2] = ["lx_nocache", "nocache"];

/// Cookie that switches the cache off for a browser session.
pub const BYPASS_COOKIE: &str = "lx_nocache";

/// Cookie prefix set by the CMS for authenticated sessions.
pub const LOGGED_IN_COOKIE_PREFIX: &str = "wordpress_logged_in_";

const EXCLUDED_PATHS: [&str; 8] = [
    "/wp-admin",
    "/wp-login.php",
    "/wp-json",
    "/xmlrpc.php",
    "/wp-cron.php",
    "/feed",
    "/embed",
    "/preview",
];

const STATIC_EXTENSIONS: [&str; 17] = [
    "css", "js", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "woff", "woff2", "ttf", "eot",
    "map", "txt", "xml", "json",
];

const DEBUG_MARKERS: [&str; 3] = ["XDEBUG_", "preview=true", "lx_debug"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Method,
    Path,
    Extension,
    Debug,
    Query,
    Cookie,
}

impl BypassReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BypassReason::Method => "method",
            BypassReason::Path => "path",
            BypassReason::Extension => "extension",
            BypassReason::Debug => "debug",
            BypassReason::Query => "query",
            BypassReason::Cookie => "cookie",
        }
    }
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stateless rule set; the same instance answers for the drop-in and the
/// repository.
#[derive(Debug, Clone, Copy, Default)]
pub struct BypassRules;

impl BypassRules {
    /// First rule that excludes the request from caching, if any.
    pub fn check(
        &self,
        method: &str,
        path: &str,
        query: Option<&str>,
        cookie_header: Option<&str>,
    ) -> Option<BypassReason> {
        if !method.eq_ignore_ascii_case("GET") {
            return Some(BypassReason::Method);
        }
        if let Some(reason) = self.check_path(path) {
            return Some(reason);
        }
        if let Some(query) = query {
            if DEBUG_MARKERS.iter().any(|marker| query.contains(marker)) {
                return Some(BypassReason::Debug);
            }
            if self.has_bypass_param(query) {
                return Some(BypassReason::Query);
            }
        }
        if cookie_header.is_some_and(|header| cookie_present(header, BYPASS_COOKIE)) {
            return Some(BypassReason::Cookie);
        }
        None
    }

    pub fn check_path(&self, path: &str) -> Option<BypassReason> {
        if EXCLUDED_PATHS.iter().any(|excluded| path.contains(excluded)) {
            return Some(BypassReason::Path);
        }
        let last_segment = path.rsplit('/').next().unwrap_or_default();
        if let Some((_, extension)) = last_segment.rsplit_once('.') {
            let extension = extension.to_ascii_lowercase();
            if STATIC_EXTENSIONS.contains(&extension.as_str()) {
                return Some(BypassReason::Extension);
            }
        }
        None
    }

    pub fn has_bypass_param(&self, query: &str) -> bool {
        BYPASS_PARAMS
            .iter()
            .any(|param| has_query_param(query, param))
    }
}

/// True when a cookie named `name` is present in a `Cookie` header value.
pub fn cookie_present(header: &str, name: &str) -> bool {
    cookie_names(header).any(|cookie| cookie == name)
}

/// True when any cookie name starts with `prefix`.
pub fn cookie_prefix_present(header: &str, prefix: &str) -> bool {
    cookie_names(header).any(|cookie| cookie.starts_with(prefix))
}

fn cookie_names(header: &str) -> impl Iterator<Item = &str> {
    header
        .split(';')
        .map(|pair| pair.split('=').next().unwrap_or_default().trim())
        .filter(|name| !name.is_empty())
}
