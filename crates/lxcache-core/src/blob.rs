//! Exported configuration blob.
//!
//! The drop-in cannot load the full configuration stack, so the server
//! exports the handful of options it needs as a flat JSON object behind a
//! fixed 16-byte prefix. The prefix makes the file inert if it is ever
//! served or executed by mistake and lets readers reject foreign files
//! without parsing them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const BLOB_PREFIX: &[u8; 16] = b"#lxcache:cfg:v1\n";

pub const OPT_CACHE: &str = "cache";
pub const OPT_MODE: &str = "mode";
pub const OPT_CACHE_DIR: &str = "cache_dir";
pub const OPT_CUSTOM_LOGIN_PATH: &str = "custom_login_path";
pub const OPT_DEFAULT_TTL: &str = "default_ttl";

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("config blob is missing the expected prefix")]
    Prefix,
    #[error("config blob is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),
}

/// How the site is wired to the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationMode {
    /// This server renders and caches pages itself.
    SelfHosted,
    /// DNS points at the edge; the local drop-in stays out of the way.
    Dns,
}

impl IntegrationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            IntegrationMode::SelfHosted => "self_hosted",
            IntegrationMode::Dns => "dns",
        }
    }
}

/// Flattened options read by the drop-in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ExportedOptions {
    values: BTreeMap<String, Value>,
}

impl ExportedOptions {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn encode(&self) -> Result<Vec<u8>, BlobError> {
        let mut out = BLOB_PREFIX.to_vec();
        serde_json::to_writer(&mut out, &self.values)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BlobError> {
        let body = bytes.strip_prefix(BLOB_PREFIX.as_slice()).ok_or(BlobError::Prefix)?;
        let values: BTreeMap<String, Value> = serde_json::from_slice(body)?;
        Ok(Self { values })
    }

    pub fn cache_enabled(&self) -> bool {
        self.get(OPT_CACHE).is_some_and(truthy)
    }

    /// Unknown or absent modes are treated as DNS so the drop-in stays out.
    pub fn mode(&self) -> IntegrationMode {
        match self.get(OPT_MODE).and_then(Value::as_str) {
            Some("self_hosted") => IntegrationMode::SelfHosted,
            _ => IntegrationMode::Dns,
        }
    }

    pub fn cache_dir(&self) -> Option<PathBuf> {
        self.get(OPT_CACHE_DIR)
            .and_then(Value::as_str)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
    }

    pub fn custom_login_path(&self) -> Option<&str> {
        self.get(OPT_CUSTOM_LOGIN_PATH)
            .and_then(Value::as_str)
            .filter(|path| !path.is_empty())
    }

    pub fn default_ttl(&self) -> Option<u32> {
        self.get(OPT_DEFAULT_TTL)
            .and_then(Value::as_u64)
            .and_then(|ttl| u32::try_from(ttl).ok())
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_i64().is_some_and(|n| n != 0),
        Value::String(text) => matches!(text.as_str(), "1" | "true" | "on" | "yes"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn encode_decode_keeps_options() {
        let mut options = ExportedOptions::default();
        options.insert(OPT_CACHE, 1);
        options.insert(OPT_MODE, "self_hosted");
        options.insert(OPT_CACHE_DIR, "/var/cache/lx");

        let bytes = options.encode().expect("encode");
        assert!(bytes.starts_with(BLOB_PREFIX));

        let decoded = ExportedOptions::decode(&bytes).expect("decode");
        assert!(decoded.cache_enabled());
        assert_eq!(decoded.mode(), IntegrationMode::SelfHosted);
        assert_eq!(decoded.cache_dir(), Some(PathBuf::from("/var/cache/lx")));
    }

    #[test]
    fn cache_flag_variants() {
        for (value, expected) in [
            (json!(0), false),
            (json!("0"), false),
            (json!(false), false),
            (json!(1), true),
            (json!("1"), true),
            (json!(true), true),
        ] {
            let mut options = ExportedOptions::default();
            options.insert(OPT_CACHE, value.clone());
            assert_eq!(options.cache_enabled(), expected, "value {value}");
        }
        assert!(!ExportedOptions::default().cache_enabled());
    }

    #[test]
    fn rejects_foreign_files() {
        assert!(matches!(
            ExportedOptions::decode(b"{\"cache\":1}"),
            Err(BlobError::Prefix)
        ));
        let mut bytes = BLOB_PREFIX.to_vec();
        bytes.extend_from_slice(b"[1,2]");
        assert!(matches!(ExportedOptions::decode(&bytes), Err(BlobError::Json(_))));
    }

    #[test]
    fn unknown_mode_is_dns() {
        let mut options = ExportedOptions::default();
        options.insert(OPT_MODE, "cname");
        assert_eq!(options.mode(), IntegrationMode::Dns);
    }
}
