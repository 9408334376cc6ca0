use std::{process, sync::Arc};

use lxcache::{
    application::error::AppError,
    cache::{CacheConfig, CacheService, CacheState},
    config::{self, Command, ExportConfigArgs, PurgeArgs, Settings},
    infra::{
        auth::StaticTokenProvider,
        error::InfraError,
        http::{self, AdminState, CacheStats},
        origin::OriginClient,
        telemetry,
        transient::{FileTransientStore, TransientStore, transient_dir},
    },
    purge::{
        CdnPurgeConfig, CdnPurgeService, EnginePurgeService, PendingPurgeList,
        ProxyCachePurgeService, PurgeCoordinator, PurgeReport, PurgeScope, PurgeService, PurgeUrl,
    },
};
use serde::Serialize;
use tokio::{sync::watch, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use url::Url;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        Command::Serve(_) => run_serve(settings).await,
        Command::Purge(args) => run_purge(settings, args).await,
        Command::PurgeAll(_) => run_purge_all(settings).await,
        Command::ExportConfig(args) => run_export_config(settings, args),
        Command::Stats(_) => run_stats(settings),
    }
}

/// Services and state shared by every command.
struct Components {
    cache: Arc<CacheService>,
    coordinator: Arc<PurgeCoordinator>,
    pending: Option<PendingPurgeList>,
}

fn build_components(settings: &Settings) -> Result<Components, AppError> {
    let cache = Arc::new(CacheService::new(CacheConfig::from(&settings.cache)));
    let transients: Arc<dyn TransientStore> = Arc::new(FileTransientStore::new(transient_dir(
        &settings.purge.state_dir,
    )));

    let mut services: Vec<Arc<dyn PurgeService>> = Vec::new();
    if settings.purge.engine {
        services.push(Arc::new(EnginePurgeService::new(cache.clone())));
    }
    if settings.proxy_cache.enabled {
        services.push(Arc::new(ProxyCachePurgeService::new(
            settings.proxy_cache.roots.clone(),
            settings.proxy_cache.devices.clone(),
        )));
    }

    let mut pending = None;
    if settings.cdn.enabled {
        let endpoint = settings.cdn.endpoint.clone().ok_or_else(|| {
            AppError::from(InfraError::configuration("cdn.endpoint is not configured"))
        })?;
        let list = PendingPurgeList::new(transients.clone());
        let service = CdnPurgeService::new(
            CdnPurgeConfig {
                endpoint,
                daemon: settings.cdn.daemon.clone(),
                deferred_purge: settings.cdn.deferred_purge,
                timeout: settings.cdn.timeout,
            },
            Arc::new(StaticTokenProvider::new(settings.cdn.token.clone())),
            list.clone(),
        )
        .map_err(|err| AppError::unexpected(format!("failed to build CDN client: {err}")))?;
        services.push(Arc::new(service));
        pending = Some(list);
    }

    info!(
        target = "lxcache::startup",
        services = ?services.iter().map(|service| service.name()).collect::<Vec<_>>(),
        cache_enabled = settings.cache.enabled,
        "purge services configured"
    );

    Ok(Components {
        cache,
        coordinator: Arc::new(PurgeCoordinator::new(services, transients)),
        pending,
    })
}

fn site_url(settings: &Settings) -> Option<Url> {
    settings
        .purge
        .site_url
        .clone()
        .or_else(|| settings.origin.url.clone())
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let components = build_components(&settings)?;

    match components.cache.config().export() {
        Ok(path) => info!(
            target = "lxcache::startup",
            path = %path.display(),
            "exported drop-in options"
        ),
        Err(err) => warn!(
            target = "lxcache::startup",
            error = %err,
            "failed to export drop-in options; the drop-in will pass through"
        ),
    }

    let origin_url = settings.origin.url.clone().ok_or_else(|| {
        AppError::from(InfraError::configuration("origin.url is required to serve"))
    })?;
    let origin = OriginClient::new(origin_url, settings.origin.timeout)?;

    let mut cache_state = CacheState::new(components.cache.clone());
    cache_state.scheme = Arc::from(settings.server.public_scheme.as_str());
    cache_state.max_body_bytes = settings.cache.max_body_bytes;

    let site_url = site_url(&settings).unwrap_or_else(|| origin.base().clone());
    let admin_state = AdminState {
        cache: components.cache.clone(),
        coordinator: components.coordinator.clone(),
        pending: components.pending.clone(),
        site_url,
    };

    let public_router = http::build_public_router(cache_state, origin);
    let admin_router = http::build_admin_router(admin_state);

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "lxcache::startup",
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        "listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        http::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));

    let graceful = settings.server.graceful_shutdown;
    let deadline = async move {
        wait_for_shutdown(shutdown_rx).await;
        tokio::time::sleep(graceful).await;
    };

    tokio::select! {
        result = async { try_join!(public_server, admin_server) } => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        () = deadline => {
            warn!(
                target = "lxcache::shutdown",
                timeout_secs = graceful.as_secs(),
                "graceful shutdown timed out"
            );
        }
    }

    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn run_purge(settings: Settings, args: PurgeArgs) -> Result<(), AppError> {
    let components = build_components(&settings)?;
    let report = components.coordinator.purge(&args.urls).await;
    finish_report(report)
}

async fn run_purge_all(settings: Settings) -> Result<(), AppError> {
    let components = build_components(&settings)?;
    let site = site_url(&settings).ok_or_else(|| {
        AppError::validation("purge-all needs purge.site_url or origin.url to be configured")
    })?;
    let report = components
        .coordinator
        .purge_targets(vec![PurgeUrl::all(site, PurgeScope::AllForDomain)], Vec::new())
        .await;
    finish_report(report)
}

fn finish_report(report: PurgeReport) -> Result<(), AppError> {
    print_json(&report)?;
    if !report.rejected.is_empty() && report.urls.is_empty() {
        return Err(AppError::validation("no valid purge URLs were supplied"));
    }
    if report.is_success() {
        Ok(())
    } else {
        Err(AppError::unexpected(format!(
            "purge run {} failed on at least one service",
            report.run_id
        )))
    }
}

fn run_export_config(mut settings: Settings, args: ExportConfigArgs) -> Result<(), AppError> {
    if let Some(output) = args.output {
        settings.cache.blob_path = output;
    }
    let config = CacheConfig::from(&settings.cache);
    let path = config
        .export()
        .map_err(|err| AppError::unexpected(format!("failed to export options: {err}")))?;
    info!(target = "lxcache::export", path = %path.display(), "exported drop-in options");
    print_json(&config.exported_options())
}

fn run_stats(settings: Settings) -> Result<(), AppError> {
    let components = build_components(&settings)?;
    let pending_purge = match components.pending.as_ref() {
        Some(pending) => pending
            .load()
            .map_err(|err| AppError::unexpected(err.to_string()))?
            .len(),
        None => 0,
    };
    print_json(&CacheStats {
        cache_bytes: components.cache.cache_size(),
        pending_purge,
        services: components.coordinator.service_names(),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
