//! Cache configuration and the options blob exported for the drop-in.

use std::path::{Path, PathBuf};
use std::time::Duration;

use lxcache_core::blob::{
    OPT_CACHE, OPT_CACHE_DIR, OPT_CUSTOM_LOGIN_PATH, OPT_DEFAULT_TTL, OPT_MODE,
};
use lxcache_core::io::write_record;
use lxcache_core::{ExportedOptions, IntegrationMode};

use super::engine::CacheError;

const DEFAULT_DIRECTORY: &str = "cache";
const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_BLOB_NAME: &str = "lxcache-config.blob";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Master switch for the file cache.
    pub enabled: bool,
    /// Root under which the `page` and `meta` namespaces live.
    pub directory: PathBuf,
    /// Lifetime of a stored page when the caller gives none.
    pub default_ttl: Duration,
    pub mode: IntegrationMode,
    /// Login URL that must never be served from or written to the cache.
    pub custom_login_path: Option<String>,
    /// Where the drop-in looks for its options blob.
    pub blob_path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let directory = PathBuf::from(DEFAULT_DIRECTORY);
        Self {
            enabled: true,
            blob_path: default_blob_path(&directory),
            directory,
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            mode: IntegrationMode::SelfHosted,
            custom_login_path: None,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            directory: settings.directory.clone(),
            default_ttl: settings.default_ttl,
            mode: settings.mode,
            custom_login_path: settings.custom_login_path.clone(),
            blob_path: settings.blob_path.clone(),
        }
    }
}

impl CacheConfig {
    /// Config rooted at `directory`, blob included.
    pub fn rooted_at(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        Self {
            blob_path: default_blob_path(&directory),
            directory,
            ..Self::default()
        }
    }

    pub fn exported_options(&self) -> ExportedOptions {
        let mut options = ExportedOptions::default();
        options.insert(OPT_CACHE, u8::from(self.enabled));
        options.insert(OPT_MODE, self.mode.as_str());
        options.insert(OPT_CACHE_DIR, self.directory.to_string_lossy().into_owned());
        options.insert(OPT_DEFAULT_TTL, self.default_ttl.as_secs());
        if let Some(path) = &self.custom_login_path {
            options.insert(OPT_CUSTOM_LOGIN_PATH, path.as_str());
        }
        options
    }

    /// Write the options blob where the drop-in expects it.
    pub fn export(&self) -> Result<&Path, CacheError> {
        let bytes = self
            .exported_options()
            .encode()
            .map_err(|_| CacheError::Corrupt(self.blob_path.clone()))?;
        write_record(&self.blob_path, None, &bytes)
            .map_err(|err| CacheError::io(&self.blob_path, err))?;
        Ok(&self.blob_path)
    }
}

pub fn default_blob_path(directory: &Path) -> PathBuf {
    directory.join(DEFAULT_BLOB_NAME)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn export_writes_a_readable_blob() {
        let dir = TempDir::new().expect("temp dir");
        let config = CacheConfig {
            custom_login_path: Some("/members".to_string()),
            ..CacheConfig::rooted_at(dir.path())
        };

        let path = config.export().expect("export");
        let bytes = std::fs::read(path).expect("read blob");
        let options = ExportedOptions::decode(&bytes).expect("decode");

        assert!(options.cache_enabled());
        assert_eq!(options.mode(), IntegrationMode::SelfHosted);
        assert_eq!(options.cache_dir().as_deref(), Some(dir.path()));
        assert_eq!(options.custom_login_path(), Some("/members"));
        assert_eq!(options.default_ttl(), Some(86_400));
    }

    #[test]
    fn disabled_cache_exports_zero() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        assert!(!config.exported_options().cache_enabled());
    }
}
