//! Single entry point for purges: dedupe, log, fan out.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde_json::{Value, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::infra::telemetry::METRIC_PURGE;
use crate::infra::transient::TransientStore;

use super::target::PurgeUrl;
use super::{PurgeError, PurgeService};

pub const PURGE_LOG_KEY: &str = "lx_purge_log";
pub const PURGE_LOG_LIMIT: usize = 50;
const PURGE_LOG_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Serialize)]
pub struct ServiceOutcome {
    pub service: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub run_id: Uuid,
    pub urls: Vec<String>,
    pub rejected: Vec<String>,
    pub outcomes: Vec<ServiceOutcome>,
}

impl PurgeReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(ServiceOutcome::is_success)
    }
}

pub struct PurgeCoordinator {
    services: Vec<Arc<dyn PurgeService>>,
    transients: Arc<dyn TransientStore>,
}

impl PurgeCoordinator {
    pub fn new(services: Vec<Arc<dyn PurgeService>>, transients: Arc<dyn TransientStore>) -> Self {
        Self {
            services,
            transients,
        }
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        self.services.iter().map(|service| service.name()).collect()
    }

    /// Parse, dedupe and purge `raw` on every active service.
    ///
    /// A failing service is reported and does not stop the others.
    #[instrument(skip_all, fields(requested = raw.len()))]
    pub async fn purge(&self, raw: &[String]) -> PurgeReport {
        let mut seen = BTreeSet::new();
        let mut targets = Vec::new();
        let mut rejected = Vec::new();
        for item in raw {
            match PurgeUrl::parse(item) {
                Ok(target) => {
                    if seen.insert(target.to_string()) {
                        targets.push(target);
                    }
                }
                Err(err) => {
                    warn!(op = "purge", error = %err, "rejecting purge url");
                    rejected.push(item.clone());
                }
            }
        }
        self.purge_targets(targets, rejected).await
    }

    pub async fn purge_targets(&self, targets: Vec<PurgeUrl>, rejected: Vec<String>) -> PurgeReport {
        let run_id = Uuid::new_v4();
        let urls: Vec<String> = targets.iter().map(ToString::to_string).collect();
        if let Err(err) = self.record(run_id, &urls) {
            warn!(op = "purge_log", error = %err, "failed to record purge run");
        }

        let mut outcomes = Vec::with_capacity(self.services.len());
        if !targets.is_empty() {
            for service in &self.services {
                let result = service.clear(&targets).await;
                let label = if result.is_ok() { "ok" } else { "error" };
                counter!(METRIC_PURGE, "service" => service.name(), "result" => label).increment(1);
                if let Err(err) = &result {
                    warn!(op = "purge", service = service.name(), error = %err, "purge service failed");
                }
                outcomes.push(ServiceOutcome {
                    service: service.name(),
                    error: result.err().map(|err| err.to_string()),
                });
            }
        }

        info!(
            op = "purge",
            run_id = %run_id,
            urls = urls.len(),
            services = outcomes.len(),
            failed = outcomes.iter().filter(|outcome| !outcome.is_success()).count(),
            "purge run finished"
        );
        PurgeReport {
            run_id,
            urls,
            rejected,
            outcomes,
        }
    }

    /// Most recent runs, oldest first.
    pub fn log(&self) -> Result<Vec<Value>, PurgeError> {
        Ok(match self.transients.get(PURGE_LOG_KEY).map_err(PurgeError::Transient)? {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        })
    }

    fn record(&self, run_id: Uuid, urls: &[String]) -> Result<(), PurgeError> {
        let at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let entry = json!({ "run_id": run_id, "at": at, "urls": urls });
        self.transients
            .update(PURGE_LOG_KEY, PURGE_LOG_TTL, &mut |current: Option<Value>| {
                let mut entries = match current {
                    Some(Value::Array(entries)) => entries,
                    _ => Vec::new(),
                };
                entries.push(entry.clone());
                if entries.len() > PURGE_LOG_LIMIT {
                    entries = entries.split_off(entries.len() - PURGE_LOG_LIMIT);
                }
                Some(Value::Array(entries))
            })
            .map(|_| ())
            .map_err(PurgeError::Transient)
    }
}
