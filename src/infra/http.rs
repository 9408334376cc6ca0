//! HTTP surfaces: the cached public proxy and the local admin listener.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::cache::{CacheService, CacheState, edge_cache_layer};
use crate::purge::{PendingPurgeList, PurgeCoordinator, PurgeReport, PurgeScope, PurgeUrl};

use super::origin::{OriginClient, proxy_to_origin};

/// Every public request runs through the edge cache, then the origin.
pub fn build_public_router(cache: CacheState, origin: OriginClient) -> Router {
    Router::new()
        .fallback(proxy_to_origin)
        .with_state(origin)
        .layer(middleware::from_fn_with_state(cache, edge_cache_layer))
}

#[derive(Clone)]
pub struct AdminState {
    pub cache: Arc<CacheService>,
    pub coordinator: Arc<PurgeCoordinator>,
    pub pending: Option<PendingPurgeList>,
    pub site_url: Url,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/purge", post(purge))
        .route("/purge-all", post(purge_all))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub cache_bytes: u64,
    pub pending_purge: usize,
    pub services: Vec<&'static str>,
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn stats(State(state): State<AdminState>) -> Json<CacheStats> {
    let pending_purge = state
        .pending
        .as_ref()
        .and_then(|pending| pending.load().ok())
        .map_or(0, |urls| urls.len());
    Json(CacheStats {
        cache_bytes: state.cache.cache_size(),
        pending_purge,
        services: state.coordinator.service_names(),
    })
}

async fn purge(
    State(state): State<AdminState>,
    Json(request): Json<PurgeRequest>,
) -> (StatusCode, Json<PurgeReport>) {
    report_response(state.coordinator.purge(&request.urls).await)
}

async fn purge_all(State(state): State<AdminState>) -> (StatusCode, Json<PurgeReport>) {
    let target = PurgeUrl::all(state.site_url.clone(), PurgeScope::AllForDomain);
    report_response(state.coordinator.purge_targets(vec![target], Vec::new()).await)
}

fn report_response(report: PurgeReport) -> (StatusCode, Json<PurgeReport>) {
    let status = if report.is_success() {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(report))
}

/// Resolves on Ctrl-C (and SIGTERM on unix).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
