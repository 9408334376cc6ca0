//! CDN purge over the upstream batch API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::gauge;
use reqwest::{Client, Url};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::infra::auth::TokenProvider;
use crate::infra::telemetry::METRIC_PENDING_PURGE_LEN;

use super::pending::PendingPurgeList;
use super::target::{PurgeScope, PurgeUrl, request_uri};
use super::{PurgeError, PurgeService};

#[derive(Debug, Clone)]
pub struct CdnPurgeConfig {
    pub endpoint: Url,
    /// Rendering daemon the purged entries belong to.
    pub daemon: String,
    /// Delay the edge applies before dropping entries.
    pub deferred_purge: Duration,
    pub timeout: Duration,
}

/// One entry of the batch body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeItem {
    pub daemon: String,
    pub domain: String,
    pub url: String,
    pub desktop: bool,
    pub mobile: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

pub struct CdnPurgeService {
    client: Client,
    config: CdnPurgeConfig,
    tokens: Arc<dyn TokenProvider>,
    pending: PendingPurgeList,
}

impl CdnPurgeService {
    pub fn new(
        config: CdnPurgeConfig,
        tokens: Arc<dyn TokenProvider>,
        pending: PendingPurgeList,
    ) -> Result<Self, PurgeError> {
        let client = Client::builder()
            .user_agent(concat!("lxcache/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            config,
            tokens,
            pending,
        })
    }

    /// Batch body for `urls`, one item per trailing-slash variant.
    pub fn items(&self, urls: &[PurgeUrl]) -> Vec<PurgeItem> {
        let mut items = Vec::new();
        for target in urls {
            let (desktop, mobile) = match target.scope {
                PurgeScope::AllForDevice(device) => (!device.is_mobile(), device.is_mobile()),
                PurgeScope::Single | PurgeScope::AllForDomain => (true, true),
            };
            let all = (!target.scope.is_single()).then_some(true);
            let variants = if target.scope.is_single() {
                target.trailing_variants()
            } else {
                vec![target.url().clone()]
            };
            for variant in variants {
                let item = PurgeItem {
                    daemon: self.config.daemon.clone(),
                    domain: target.host().to_string(),
                    url: request_uri(&variant),
                    desktop,
                    mobile,
                    canonical: target.canonical,
                    all,
                    deleted: target.deleted.then_some(true),
                };
                if !items.contains(&item) {
                    items.push(item);
                }
            }
        }
        items
    }

    async fn send(&self, items: &[PurgeItem]) -> Result<(), PurgeError> {
        let token = self
            .tokens
            .bearer_token()
            .await
            .map_err(PurgeError::Token)?;

        let request_id = Uuid::new_v4();
        let mut url = self.config.endpoint.clone();
        url.query_pairs_mut()
            .append_pair(
                "deferred_purge",
                &self.config.deferred_purge.as_secs().to_string(),
            )
            .append_pair("request_id", &request_id.to_string());

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(items)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PurgeError::Status {
                status: status.as_u16(),
                body,
            });
        }
        info!(
            op = "cdn_purge",
            result = "ok",
            request_id = %request_id,
            items = items.len(),
            "cdn purge accepted"
        );
        Ok(())
    }
}

#[async_trait]
impl PurgeService for CdnPurgeService {
    fn name(&self) -> &'static str {
        "cdn"
    }

    /// Sends the backlog together with `urls`. The merged list is persisted
    /// before the request goes out and only the sent URLs are dropped on
    /// success, so a failure or crash leaves every URL queued.
    #[instrument(skip_all, fields(urls = urls.len()))]
    async fn clear(&self, urls: &[PurgeUrl]) -> Result<(), PurgeError> {
        let incoming: Vec<String> = urls.iter().map(ToString::to_string).collect();
        let batch = self.pending.merge(&incoming)?;
        gauge!(METRIC_PENDING_PURGE_LEN).set(batch.len() as f64);

        let mut targets = Vec::with_capacity(batch.len());
        for raw in &batch {
            match PurgeUrl::parse(raw) {
                Ok(target) => targets.push(target),
                Err(err) => warn!(op = "cdn_purge", error = %err, "dropping unparseable pending url"),
            }
        }

        if let Err(err) = self.send(&self.items(&targets)).await {
            warn!(
                op = "cdn_purge",
                result = "deferred",
                pending = batch.len(),
                error = %err,
                "cdn purge failed; urls kept for the next run"
            );
            return Err(err);
        }

        let remaining = self.pending.remove(&batch)?;
        gauge!(METRIC_PENDING_PURGE_LEN).set(remaining.len() as f64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::infra::auth::StaticTokenProvider;
    use crate::infra::transient::MemoryTransientStore;
    use lxcache_core::Device;

    use super::*;

    fn service() -> CdnPurgeService {
        CdnPurgeService::new(
            CdnPurgeConfig {
                endpoint: Url::parse("https://purge.example.net/v1/purge").expect("url"),
                daemon: "prism".to_string(),
                deferred_purge: Duration::from_secs(30),
                timeout: Duration::from_secs(5),
            },
            Arc::new(StaticTokenProvider::new(Some("secret".to_string()))),
            PendingPurgeList::new(Arc::new(MemoryTransientStore::new())),
        )
        .expect("service")
    }

    #[test]
    fn single_urls_expand_to_both_slash_forms() {
        let target = PurgeUrl::parse("https://example.com/post/?canonical=1").expect("parse");
        let items = service().items(&[target]);
        let urls: Vec<&str> = items.iter().map(|item| item.url.as_str()).collect();
        assert_eq!(urls, ["/post/", "/post"]);
        assert!(items.iter().all(|item| item.domain == "example.com"));
        assert!(items.iter().all(|item| item.canonical == Some(true)));
        assert!(items.iter().all(|item| item.all.is_none()));
    }

    #[test]
    fn device_scope_sets_flags() {
        let target = PurgeUrl::all(
            Url::parse("https://example.com/").expect("url"),
            PurgeScope::AllForDevice(Device::Mobile),
        );
        let items = service().items(&[target]);
        assert_eq!(items.len(), 1);
        assert!(items[0].mobile && !items[0].desktop);
        assert_eq!(items[0].all, Some(true));
    }

    #[test]
    fn optional_fields_are_omitted() {
        let target = PurgeUrl::parse("https://example.com/").expect("parse");
        let items = service().items(&[target]);
        let json = serde_json::to_value(&items).expect("json");
        let item = json[0].as_object().expect("object");
        assert!(!item.contains_key("canonical"));
        assert!(!item.contains_key("all"));
        assert!(!item.contains_key("deleted"));
        assert_eq!(item["daemon"], "prism");
    }
}
