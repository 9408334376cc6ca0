//! Cache key policy.
//!
//! A key is the page URL plus two flags, rendered as `{url}:{prism}:{mobile}`.
//! Mobile and desktop renders, and prism and non-prism renders, must never
//! share a storage slot, so both flags always take part in the key.

use std::fmt;

/// Query parameter that forces the prism variant regardless of device.
pub const PRISM_DEBUG_PARAM: &str = "lx_prism";

/// Device class a page was rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Device {
    Desktop,
    Mobile,
}

impl Device {
    pub const ALL: [Device; 2] = [Device::Desktop, Device::Mobile];

    pub fn as_str(self) -> &'static str {
        match self {
            Device::Desktop => "desktop",
            Device::Mobile => "mobile",
        }
    }

    pub fn is_mobile(self) -> bool {
        matches!(self, Device::Mobile)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "desktop" => Some(Device::Desktop),
            "mobile" => Some(Device::Mobile),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a cached page variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub url: String,
    pub prism: bool,
    pub mobile: bool,
}

impl CacheKey {
    pub fn new(url: impl Into<String>, mobile: bool, prism: bool) -> Self {
        Self {
            url: url.into(),
            prism,
            mobile,
        }
    }

    /// Recover a key from its rendered form.
    ///
    /// Splits from the right so URLs carrying `:` (schemes, ports) survive.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.rsplitn(3, ':');
        let mobile = parse_flag(parts.next()?)?;
        let prism = parse_flag(parts.next()?)?;
        let url = parts.next()?;
        if url.is_empty() {
            return None;
        }
        Some(Self::new(url, mobile, prism))
    }

    pub fn device(&self) -> Device {
        if self.mobile {
            Device::Mobile
        } else {
            Device::Desktop
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.url,
            u8::from(self.prism),
            u8::from(self.mobile)
        )
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

/// Device sniffing shared by every runtime context.
pub fn is_mobile_user_agent(user_agent: &str) -> bool {
    if user_agent.is_empty() {
        return false;
    }
    // Tablets report "Mobile" too but get the desktop layout.
    if user_agent.contains("Mobile") && !user_agent.contains("iPad") {
        return true;
    }
    const MARKERS: [&str; 6] = [
        "Android",
        "Silk/",
        "Kindle",
        "BlackBerry",
        "Opera Mini",
        "Opera Mobi",
    ];
    MARKERS.iter().any(|marker| user_agent.contains(marker))
}

/// Per-request view used to derive keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestProfile {
    pub url: String,
    pub mobile: bool,
    pub prism: bool,
    pub debug_override: bool,
}

impl RequestProfile {
    pub fn detect(url: impl Into<String>, user_agent: &str, query: Option<&str>) -> Self {
        let mobile = is_mobile_user_agent(user_agent);
        let debug_override = query.is_some_and(|query| has_query_param(query, PRISM_DEBUG_PARAM));
        Self {
            url: url.into(),
            mobile,
            prism: mobile || debug_override,
            debug_override,
        }
    }

    pub fn key(&self) -> CacheKey {
        self.key_for(&self.url)
    }

    pub fn key_for(&self, url: &str) -> CacheKey {
        CacheKey::new(url, self.mobile, self.prism)
    }
}

/// Absolute page URL used as the key's `url` component.
///
/// Storage and purge both build keys through here. Scheme and host are
/// lowercased, a default port is dropped and the prism debug parameter is
/// removed; the remaining query pairs are kept byte for byte.
pub fn page_url(scheme: &str, host: &str, path: &str, query: Option<&str>) -> String {
    let scheme = scheme.to_ascii_lowercase();
    let host = normalize_host(&scheme, host);
    match query.and_then(|query| strip_query_params(query, &[PRISM_DEBUG_PARAM])) {
        Some(query) => format!("{scheme}://{host}{path}?{query}"),
        None => format!("{scheme}://{host}{path}"),
    }
}

/// Raw query without the pairs named in `names`; `None` when nothing is left.
pub fn strip_query_params(query: &str, names: &[&str]) -> Option<String> {
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty() && !names.contains(&query_pair_name(pair)))
        .collect();
    (!kept.is_empty()).then(|| kept.join("&"))
}

/// Name half of a raw `name=value` pair.
pub fn query_pair_name(pair: &str) -> &str {
    pair.split('=').next().unwrap_or(pair)
}

fn normalize_host(scheme: &str, host: &str) -> String {
    let host = host.to_ascii_lowercase();
    let default_port = match scheme {
        "http" => ":80",
        "https" => ":443",
        _ => return host,
    };
    match host.strip_suffix(default_port) {
        Some(bare) => bare.to_string(),
        None => host,
    }
}

/// True when `name` appears as a parameter in a raw query string.
pub fn has_query_param(query: &str, name: &str) -> bool {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .any(|pair| query_pair_name(pair) == name)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
    const IPAD: &str = "Mozilla/5.0 (iPad; CPU OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
    const DESKTOP: &str =
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

    #[test]
    fn key_renders_flags() {
        let key = CacheKey::new("https://example.com/post/", true, false);
        assert_eq!(key.to_string(), "https://example.com/post/:0:1");
    }

    #[test]
    fn flag_combinations_never_collide() {
        let url = "https://example.com/post/";
        let keys: HashSet<String> = [(false, false), (false, true), (true, false), (true, true)]
            .into_iter()
            .map(|(mobile, prism)| CacheKey::new(url, mobile, prism).to_string())
            .collect();
        assert_eq!(keys.len(), 4);
    }

    #[test]
    fn key_is_deterministic() {
        let a = CacheKey::new("https://example.com/", true, true);
        let b = CacheKey::new("https://example.com/", true, true);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn parse_survives_colons_in_url() {
        let key = CacheKey::new("https://example.com:8443/a:b/", false, true);
        let parsed = CacheKey::parse(&key.to_string()).expect("parse key");
        assert_eq!(parsed, key);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(CacheKey::parse("https://example.com/").is_none());
        assert!(CacheKey::parse("https://example.com/:2:0").is_none());
        assert!(CacheKey::parse(":1:1").is_none());
    }

    #[test]
    fn sniffs_devices() {
        assert!(is_mobile_user_agent(IPHONE));
        assert!(!is_mobile_user_agent(IPAD));
        assert!(!is_mobile_user_agent(DESKTOP));
        assert!(is_mobile_user_agent("Mozilla/5.0 (Linux; Android 14)"));
        assert!(!is_mobile_user_agent(""));
    }

    #[test]
    fn debug_override_forces_prism() {
        let profile = RequestProfile::detect("https://example.com/", DESKTOP, Some("lx_prism=1"));
        assert!(profile.prism);
        assert!(!profile.mobile);
        assert_eq!(profile.key().to_string(), "https://example.com/:1:0");
    }

    #[test]
    fn mobile_profile_is_prism() {
        let profile = RequestProfile::detect("https://example.com/", IPHONE, None);
        assert!(profile.prism && profile.mobile);
    }

    #[test]
    fn page_url_keeps_query() {
        assert_eq!(
            page_url("https", "example.com", "/post/", Some("page=2")),
            "https://example.com/post/?page=2"
        );
        assert_eq!(page_url("http", "example.com", "/", Some("")), "http://example.com/");
    }

    #[test]
    fn page_url_drops_prism_debug_param() {
        assert_eq!(
            page_url("https", "example.com", "/post/", Some("lx_prism=1")),
            "https://example.com/post/"
        );
        assert_eq!(
            page_url("https", "example.com", "/post/", Some("q=a%20b&lx_prism&page")),
            "https://example.com/post/?q=a%20b&page"
        );
    }

    #[test]
    fn page_url_normalizes_authority() {
        assert_eq!(
            page_url("HTTPS", "Example.COM:443", "/", None),
            "https://example.com/"
        );
        assert_eq!(
            page_url("http", "example.com:8080", "/", None),
            "http://example.com:8080/"
        );
        assert_eq!(page_url("http", "example.com:80", "/", None), "http://example.com/");
    }

    #[test]
    fn query_param_detection_is_exact() {
        assert!(has_query_param("a=1&lx_nocache", "lx_nocache"));
        assert!(!has_query_param("lx_nocache_x=1", "lx_nocache"));
    }
}
