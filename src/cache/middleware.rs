//! Edge cache middleware.
//!
//! Runs the drop-in in front of every route. Hits are answered straight
//! from disk; passthroughs run the origin and, for eligible HTML, write the
//! body back through the repository under the same key the drop-in reads.
//! Disk work runs on the blocking pool.

use std::sync::Arc;

use axum::{
    body::{Body, HttpBody as _},
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::counter;
use tracing::{debug, instrument, warn};

use crate::infra::telemetry::{METRIC_BYPASS, METRIC_HIT, METRIC_MISS, METRIC_STORE};

use super::dropin::{Dropin, DropinOutcome, DropinRequest, PassReason};
use super::repository::CacheService;

/// Response header naming how the cache handled the request.
pub const CACHE_STATUS_HEADER: &str = "x-lx-cache";

const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub service: Arc<CacheService>,
    pub dropin: Arc<Dropin>,
    /// Scheme used in keys when no `x-forwarded-proto` header is present.
    pub scheme: Arc<str>,
    pub max_body_bytes: usize,
}

impl CacheState {
    pub fn new(service: Arc<CacheService>) -> Self {
        let dropin = Arc::new(Dropin::new(service.config().blob_path.clone()));
        Self {
            service,
            dropin,
            scheme: Arc::from("https"),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Owned copy of the request facts so the request itself can move on.
#[derive(Clone)]
struct RequestFacts {
    method: String,
    scheme: String,
    host: String,
    path: String,
    query: Option<String>,
    user_agent: String,
    cookie: Option<String>,
}

impl RequestFacts {
    fn capture(request: &Request, default_scheme: &str) -> Self {
        let headers = request.headers();
        let host = header_str(headers, header::HOST.as_str())
            .map(str::to_string)
            .or_else(|| request.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();
        Self {
            method: request.method().as_str().to_string(),
            scheme: header_str(headers, "x-forwarded-proto")
                .unwrap_or(default_scheme)
                .to_string(),
            host,
            path: request.uri().path().to_string(),
            query: request.uri().query().map(str::to_string),
            user_agent: header_str(headers, header::USER_AGENT.as_str())
                .unwrap_or_default()
                .to_string(),
            cookie: header_str(headers, header::COOKIE.as_str()).map(str::to_string),
        }
    }

    fn as_dropin(&self) -> DropinRequest<'_> {
        DropinRequest {
            method: &self.method,
            scheme: &self.scheme,
            host: &self.host,
            path: &self.path,
            query: self.query.as_deref(),
            user_agent: &self.user_agent,
            cookie: self.cookie.as_deref(),
        }
    }
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn edge_cache_layer(
    State(cache): State<CacheState>,
    request: Request,
    next: Next,
) -> Response {
    let facts = RequestFacts::capture(&request, &cache.scheme);

    let dropin = Arc::clone(&cache.dropin);
    let lookup = facts.clone();
    let outcome = tokio::task::spawn_blocking(move || dropin.handle(&lookup.as_dropin()))
        .await
        .unwrap_or_else(|err| {
            warn!(op = "dropin", error = %err, "cache lookup task failed");
            DropinOutcome::Passthrough {
                reason: PassReason::Error,
                do_not_cache: false,
            }
        });

    let (reason, do_not_cache) = match outcome {
        DropinOutcome::Hit { body, .. } => {
            counter!(METRIC_HIT).increment(1);
            let mut response = Response::new(Body::from(body));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=UTF-8"),
            );
            tag(&mut response, "HIT");
            return response;
        }
        DropinOutcome::Passthrough {
            reason,
            do_not_cache,
        } => (reason, do_not_cache),
    };

    let mut response = next.run(request).await;

    if do_not_cache {
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
    if !reason.is_storable() || do_not_cache {
        counter!(METRIC_BYPASS, "reason" => reason.as_str()).increment(1);
        tag(&mut response, "BYPASS");
        return response;
    }

    counter!(METRIC_MISS).increment(1);
    if !is_storable_response(&response) {
        tag(&mut response, "MISS");
        return response;
    }

    // Bodies without a known bound under the limit stream through unstored.
    let (parts, body) = response.into_parts();
    let limit = u64::try_from(cache.max_body_bytes).unwrap_or(u64::MAX);
    if body.size_hint().upper().is_none_or(|upper| upper > limit) {
        debug!(op = "store", limit, "origin body unbounded or over limit, not cached");
        let mut response = Response::from_parts(parts, body);
        tag(&mut response, "MISS");
        return response;
    }

    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(op = "store", error = %err, "origin body failed mid-stream");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let service = Arc::clone(&cache.service);
    let payload = bytes.clone();
    let stored = tokio::task::spawn_blocking(move || {
        let request = facts.as_dropin();
        let repository = service.for_request(request.profile(), None);
        let url = request.url();
        repository.set(&url, &payload, None).then(|| repository.key(&url))
    })
    .await;
    match stored {
        Ok(Some(key)) => {
            counter!(METRIC_STORE).increment(1);
            debug!(op = "store", key = %key, bytes = bytes.len(), "cached origin response");
        }
        Ok(None) => {}
        Err(err) => warn!(op = "store", error = %err, "cache store task failed"),
    }

    let mut response = Response::from_parts(parts, Body::from(bytes));
    tag(&mut response, "MISS");
    response
}

fn tag(response: &mut Response, status: &'static str) {
    response
        .headers_mut()
        .insert(CACHE_STATUS_HEADER, HeaderValue::from_static(status));
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Only complete HTML pages the origin allows to be stored.
fn is_storable_response(response: &Response) -> bool {
    if response.status() != StatusCode::OK {
        return false;
    }
    let headers = response.headers();
    let is_html = header_str(headers, header::CONTENT_TYPE.as_str())
        .is_some_and(|value| value.to_ascii_lowercase().starts_with("text/html"));
    let no_store = header_str(headers, header::CACHE_CONTROL.as_str()).is_some_and(|value| {
        let value = value.to_ascii_lowercase();
        value.contains("no-store") || value.contains("private")
    });
    is_html && !no_store && !headers.contains_key(header::SET_COOKIE)
}
