use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.public_port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        public_port: Some(4321),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.public_addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_resolve_without_any_source() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.public_addr.port(), DEFAULT_PUBLIC_PORT);
    assert_eq!(settings.server.admin_addr.port(), DEFAULT_ADMIN_PORT);
    assert_eq!(settings.server.public_scheme, "https");
    assert!(settings.cache.enabled);
    assert_eq!(settings.cache.directory, PathBuf::from(DEFAULT_CACHE_DIR));
    assert_eq!(settings.cache.default_ttl, Duration::from_secs(86_400));
    assert!(matches!(settings.cache.mode, IntegrationMode::SelfHosted));
    assert!(settings.cache.blob_path.starts_with(DEFAULT_CACHE_DIR));
    assert_eq!(settings.cdn.timeout, Duration::from_secs(15));
    assert_eq!(settings.cdn.daemon, "prism");
    assert!(!settings.cdn.enabled);
    assert!(!settings.proxy_cache.enabled);
    assert_eq!(settings.proxy_cache.devices, Device::ALL.to_vec());
    assert!(settings.purge.engine);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn cache_directory_override_applies_to_every_command() {
    let mut raw = RawSettings::default();
    raw.cache.directory = Some(PathBuf::from("/var/cache/a"));
    raw.apply_cache_override(&CacheOverride {
        cache_directory: Some(PathBuf::from("/var/cache/b")),
    });

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.directory, PathBuf::from("/var/cache/b"));
}

#[test]
fn default_to_serve_command() {
    let cli = CliArgs::try_parse_from(["lxcache"]).expect("parse cli");
    assert!(cli.command.is_none());
}

#[test]
fn parse_serve_overrides() {
    let cli = CliArgs::try_parse_from([
        "lxcache",
        "serve",
        "--server-public-port",
        "9000",
        "--origin-url",
        "http://127.0.0.1:8000",
        "--cache-enabled",
        "false",
    ])
    .expect("parse cli");

    let Some(Command::Serve(args)) = cli.command else {
        panic!("expected serve command");
    };
    assert_eq!(args.overrides.public_port, Some(9000));
    assert_eq!(
        args.overrides.origin_url.as_deref(),
        Some("http://127.0.0.1:8000")
    );
    assert_eq!(args.overrides.cache_enabled, Some(false));
}

#[test]
fn parse_purge_command() {
    let cli = CliArgs::try_parse_from([
        "lxcache",
        "purge",
        "https://example.com/post/",
        "https://example.com/?purge_all",
    ])
    .expect("parse cli");

    let Some(Command::Purge(args)) = cli.command else {
        panic!("expected purge command");
    };
    assert_eq!(args.urls.len(), 2);
}

#[test]
fn purge_requires_urls() {
    assert!(CliArgs::try_parse_from(["lxcache", "purge"]).is_err());
}

#[test]
fn zero_ttl_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.default_ttl_seconds = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero ttl");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.default_ttl_seconds",
            ..
        }
    ));
}

#[test]
fn unknown_mode_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.mode = Some("edge".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn dns_mode_is_parsed() {
    let mut raw = RawSettings::default();
    raw.cache.mode = Some("dns".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(matches!(settings.cache.mode, IntegrationMode::Dns));
}

#[test]
fn custom_login_path_must_be_absolute() {
    let mut raw = RawSettings::default();
    raw.cache.custom_login_path = Some("login".to_string());
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.cache.custom_login_path = Some("  ".to_string());
    let settings = Settings::from_raw(raw).expect("blank path is ignored");
    assert!(settings.cache.custom_login_path.is_none());
}

#[test]
fn enabled_cdn_requires_endpoint() {
    let mut raw = RawSettings::default();
    raw.cdn.enabled = Some(true);
    let err = Settings::from_raw(raw).expect_err("missing endpoint");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cdn.endpoint",
            ..
        }
    ));
}

#[test]
fn cdn_timeout_is_bounded() {
    let mut raw = RawSettings::default();
    raw.cdn.timeout_seconds = Some(MAX_CDN_TIMEOUT_SECS + 1);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn cdn_endpoint_must_be_http() {
    let mut raw = RawSettings::default();
    raw.cdn.endpoint = Some("ftp://cdn.example.com/purge".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn proxy_cache_devices_are_parsed_and_deduplicated() {
    let mut raw = RawSettings::default();
    raw.proxy_cache.enabled = Some(true);
    raw.proxy_cache.roots = Some(vec![PathBuf::from("/var/cache/nginx")]);
    raw.proxy_cache.devices = Some(vec![
        "mobile".to_string(),
        "Mobile".to_string(),
        "desktop".to_string(),
    ]);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.proxy_cache.devices,
        vec![Device::Mobile, Device::Desktop]
    );
}

#[test]
fn proxy_cache_rejects_unknown_device() {
    let mut raw = RawSettings::default();
    raw.proxy_cache.devices = Some(vec!["tablet".to_string()]);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn enabled_proxy_cache_requires_roots() {
    let mut raw = RawSettings::default();
    raw.proxy_cache.enabled = Some(true);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn public_scheme_is_validated() {
    let mut raw = RawSettings::default();
    raw.server.public_scheme = Some("gopher".to_string());
    assert!(Settings::from_raw(raw).is_err());
}
