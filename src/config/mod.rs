//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use lxcache_core::{Device, IntegrationMode};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "lxcache";
const ENV_PREFIX: &str = "LXCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 8080;
const DEFAULT_ADMIN_PORT: u16 = 8081;
const DEFAULT_PUBLIC_SCHEME: &str = "https";
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_DIR: &str = "cache";
const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_MAX_BODY_BYTES: u64 = 8 * 1024 * 1024;
const DEFAULT_ORIGIN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CDN_DAEMON: &str = "prism";
const DEFAULT_CDN_TIMEOUT_SECS: u64 = 15;
const MAX_CDN_TIMEOUT_SECS: u64 = 120;
const DEFAULT_CDN_DEFERRED_PURGE_SECS: u64 = 0;
const DEFAULT_STATE_DIR: &str = "state";

/// Command-line arguments for the lxcache binary.
#[derive(Debug, Parser)]
#[command(name = "lxcache", version, about = "Edge page cache and purge orchestrator")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "LXCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching proxy and the admin listener.
    Serve(Box<ServeArgs>),
    /// Purge URLs from every active cache tier.
    Purge(PurgeArgs),
    /// Purge the whole site from every active cache tier.
    #[command(name = "purge-all")]
    PurgeAll(CacheOverride),
    /// Write the options blob read by the drop-in.
    #[command(name = "export-config")]
    ExportConfig(ExportConfigArgs),
    /// Print cache size and the pending CDN purge backlog.
    Stats(CacheOverride),
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverride {
    /// Override the cache root directory.
    #[arg(long = "cache-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub cache_directory: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub cache: CacheOverride,

    /// Override the public listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the origin base URL.
    #[arg(long = "origin-url", value_name = "URL")]
    pub origin_url: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle the file cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,
}

#[derive(Debug, Args, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub cache: CacheOverride,

    /// Absolute URLs to purge; `?purge_all`, `?canonical=` and `?deleted`
    /// markers are honoured.
    #[arg(value_name = "URL", required = true)]
    pub urls: Vec<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ExportConfigArgs {
    #[command(flatten)]
    pub cache: CacheOverride,

    /// Write the blob here instead of the configured path.
    #[arg(long = "output", value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: Option<PathBuf>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub origin: OriginSettings,
    pub cdn: CdnSettings,
    pub proxy_cache: ProxyCacheSettings,
    pub purge: PurgeSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    /// Scheme used in cache keys when no `x-forwarded-proto` is sent.
    pub public_scheme: String,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    pub default_ttl: Duration,
    pub mode: IntegrationMode,
    pub custom_login_path: Option<String>,
    pub blob_path: PathBuf,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    pub url: Option<Url>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CdnSettings {
    pub enabled: bool,
    pub endpoint: Option<Url>,
    pub daemon: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub deferred_purge: Duration,
}

#[derive(Debug, Clone)]
pub struct ProxyCacheSettings {
    pub enabled: bool,
    pub roots: Vec<PathBuf>,
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone)]
pub struct PurgeSettings {
    /// Purge the local file cache alongside the remote tiers.
    pub engine: bool,
    /// Directory for transients (pending purges, purge log).
    pub state_dir: PathBuf,
    /// Site root used for whole-domain purges.
    pub site_url: Option<Url>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("proxy_cache.roots")
            .with_list_parse_key("proxy_cache.devices"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Purge(args)) => raw.apply_cache_override(&args.cache),
        Some(Command::PurgeAll(cache)) | Some(Command::Stats(cache)) => {
            raw.apply_cache_override(cache)
        }
        Some(Command::ExportConfig(args)) => raw.apply_cache_override(&args.cache),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    origin: RawOriginSettings,
    cdn: RawCdnSettings,
    proxy_cache: RawProxyCacheSettings,
    purge: RawPurgeSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(url) = overrides.origin_url.as_ref() {
            self.origin.url = Some(url.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }

        self.apply_cache_override(&overrides.cache);
    }

    fn apply_cache_override(&mut self, overrides: &CacheOverride) {
        if let Some(directory) = overrides.cache_directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            origin,
            cdn,
            proxy_cache,
            purge,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let origin = build_origin_settings(origin)?;
        let cdn = build_cdn_settings(cdn)?;
        let proxy_cache = build_proxy_cache_settings(proxy_cache)?;
        let purge = build_purge_settings(purge)?;

        Ok(Self {
            server,
            logging,
            cache,
            origin,
            cdn,
            proxy_cache,
            purge,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    let public_scheme = server
        .public_scheme
        .unwrap_or_else(|| DEFAULT_PUBLIC_SCHEME.to_string());
    if !matches!(public_scheme.as_str(), "http" | "https") {
        return Err(LoadError::invalid(
            "server.public_scheme",
            format!("expected `http` or `https`, got `{public_scheme}`"),
        ));
    }

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        public_scheme,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let directory = cache
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid("cache.directory", "path must not be empty"));
    }

    let ttl_secs = cache.default_ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS);
    if ttl_secs == 0 || ttl_secs > u64::from(u32::MAX) {
        return Err(LoadError::invalid(
            "cache.default_ttl_seconds",
            "must be between 1 and 4294967295",
        ));
    }

    let mode = match cache.mode.as_deref().map(str::trim) {
        None | Some("self_hosted") => IntegrationMode::SelfHosted,
        Some("dns") => IntegrationMode::Dns,
        Some(other) => {
            return Err(LoadError::invalid(
                "cache.mode",
                format!("expected `self_hosted` or `dns`, got `{other}`"),
            ));
        }
    };

    let custom_login_path = cache.custom_login_path.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if let Some(path) = custom_login_path.as_deref() {
        if !path.starts_with('/') {
            return Err(LoadError::invalid(
                "cache.custom_login_path",
                "must start with `/`",
            ));
        }
    }

    let blob_path = cache
        .blob_path
        .unwrap_or_else(|| crate::cache::default_blob_path(&directory));

    let max_body = cache.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES);
    if max_body == 0 {
        return Err(LoadError::invalid(
            "cache.max_body_bytes",
            "must be greater than zero",
        ));
    }
    let max_body_bytes = usize::try_from(max_body).map_err(|_| {
        LoadError::invalid(
            "cache.max_body_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        directory,
        default_ttl: Duration::from_secs(ttl_secs),
        mode,
        custom_login_path,
        blob_path,
        max_body_bytes,
    })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let url = parse_optional_url(origin.url, "origin.url")?;
    let timeout_secs = origin.timeout_seconds.unwrap_or(DEFAULT_ORIGIN_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "origin.timeout_seconds",
            "must be greater than zero",
        ));
    }
    Ok(OriginSettings {
        url,
        timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_cdn_settings(cdn: RawCdnSettings) -> Result<CdnSettings, LoadError> {
    let enabled = cdn.enabled.unwrap_or(false);
    let endpoint = parse_optional_url(cdn.endpoint, "cdn.endpoint")?;
    if enabled && endpoint.is_none() {
        return Err(LoadError::invalid(
            "cdn.endpoint",
            "required when the CDN purge is enabled",
        ));
    }

    let timeout_secs = cdn.timeout_seconds.unwrap_or(DEFAULT_CDN_TIMEOUT_SECS);
    if timeout_secs == 0 || timeout_secs > MAX_CDN_TIMEOUT_SECS {
        return Err(LoadError::invalid(
            "cdn.timeout_seconds",
            format!("must be between 1 and {MAX_CDN_TIMEOUT_SECS}"),
        ));
    }

    let daemon = cdn
        .daemon
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_CDN_DAEMON.to_string());

    let token = cdn.token.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    Ok(CdnSettings {
        enabled,
        endpoint,
        daemon,
        token,
        timeout: Duration::from_secs(timeout_secs),
        deferred_purge: Duration::from_secs(
            cdn.deferred_purge_seconds
                .unwrap_or(DEFAULT_CDN_DEFERRED_PURGE_SECS),
        ),
    })
}

fn build_proxy_cache_settings(
    proxy: RawProxyCacheSettings,
) -> Result<ProxyCacheSettings, LoadError> {
    let enabled = proxy.enabled.unwrap_or(false);
    let roots: Vec<PathBuf> = proxy
        .roots
        .unwrap_or_default()
        .into_iter()
        .filter(|root| !root.as_os_str().is_empty())
        .collect();
    if enabled && roots.is_empty() {
        return Err(LoadError::invalid(
            "proxy_cache.roots",
            "at least one root is required when the proxy cache purge is enabled",
        ));
    }

    let devices = match proxy.devices {
        None => Device::ALL.to_vec(),
        Some(raw) => {
            let mut devices = Vec::new();
            for value in raw {
                let device = Device::parse(&value).ok_or_else(|| {
                    LoadError::invalid(
                        "proxy_cache.devices",
                        format!("unknown device `{value}`"),
                    )
                })?;
                if !devices.contains(&device) {
                    devices.push(device);
                }
            }
            devices
        }
    };
    if enabled && devices.is_empty() {
        return Err(LoadError::invalid(
            "proxy_cache.devices",
            "at least one device is required",
        ));
    }

    Ok(ProxyCacheSettings {
        enabled,
        roots,
        devices,
    })
}

fn build_purge_settings(purge: RawPurgeSettings) -> Result<PurgeSettings, LoadError> {
    let state_dir = purge
        .state_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
    if state_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid("purge.state_dir", "path must not be empty"));
    }
    Ok(PurgeSettings {
        engine: purge.engine.unwrap_or(true),
        state_dir,
        site_url: parse_optional_url(purge.site_url, "purge.site_url")?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    public_scheme: Option<String>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    directory: Option<PathBuf>,
    default_ttl_seconds: Option<u64>,
    mode: Option<String>,
    custom_login_path: Option<String>,
    blob_path: Option<PathBuf>,
    max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    url: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCdnSettings {
    enabled: Option<bool>,
    endpoint: Option<String>,
    daemon: Option<String>,
    token: Option<String>,
    timeout_seconds: Option<u64>,
    deferred_purge_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawProxyCacheSettings {
    enabled: Option<bool>,
    roots: Option<Vec<PathBuf>>,
    devices: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPurgeSettings {
    engine: Option<bool>,
    state_dir: Option<PathBuf>,
    site_url: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_optional_url(value: Option<String>, key: &'static str) -> Result<Option<Url>, LoadError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let url = Url::parse(trimmed)
        .map_err(|err| LoadError::invalid(key, format!("invalid URL `{trimmed}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(key, "URL must use http or https"));
    }
    Ok(Some(url))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
