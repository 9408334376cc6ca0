use std::{fs, sync::Arc, time::Duration};

use httpmock::MockServer;
use lxcache::{
    infra::{auth::StaticTokenProvider, transient::MemoryTransientStore},
    purge::{
        CdnPurgeConfig, CdnPurgeService, PendingPurgeList, ProxyCachePurgeService,
        PurgeCoordinator, PurgeError, PurgeService, PurgeUrl,
    },
};
use lxcache_core::Device;
use serde_json::json;
use tempfile::TempDir;
use url::Url;

fn cdn_service(server: &MockServer, pending: PendingPurgeList) -> CdnPurgeService {
    cdn_service_with_token(server, pending, Some("secret"))
}

fn cdn_service_with_token(
    server: &MockServer,
    pending: PendingPurgeList,
    token: Option<&str>,
) -> CdnPurgeService {
    CdnPurgeService::new(
        CdnPurgeConfig {
            endpoint: Url::parse(&server.url("/purge")).expect("endpoint"),
            daemon: "prism".to_string(),
            deferred_purge: Duration::ZERO,
            timeout: Duration::from_secs(5),
        },
        Arc::new(StaticTokenProvider::new(token.map(str::to_string))),
        pending,
    )
    .expect("cdn service")
}

fn targets(raw: &[&str]) -> Vec<PurgeUrl> {
    raw.iter()
        .map(|url| PurgeUrl::parse(url).expect("purge url"))
        .collect()
}

fn rendered(raw: &[&str]) -> Vec<String> {
    let mut urls: Vec<String> = targets(raw).iter().map(ToString::to_string).collect();
    urls.sort();
    urls
}

fn sorted(mut urls: Vec<String>) -> Vec<String> {
    urls.sort();
    urls
}

#[tokio::test]
async fn cdn_success_clears_pending_list() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("POST")
            .path("/purge")
            .query_param("deferred_purge", "0");
        then.status(200);
    });

    let pending = PendingPurgeList::new(Arc::new(MemoryTransientStore::new()));
    let service = cdn_service(&server, pending.clone());

    service
        .clear(&targets(&["https://example.com/a/"]))
        .await
        .expect("cdn purge");

    mock.assert();
    assert!(pending.load().expect("pending").is_empty());
}

#[tokio::test]
async fn cdn_request_carries_token_request_id_and_batch() {
    let server = MockServer::start();
    let item = |url: &str| {
        json!({
            "daemon": "prism",
            "domain": "example.com",
            "url": url,
            "desktop": true,
            "mobile": true,
            "canonical": true,
            "deleted": true,
        })
    };
    let mock = server.mock(|when, then| {
        when.method("POST")
            .path("/purge")
            .header("authorization", "Bearer secret")
            .header("content-type", "application/json")
            .query_param("deferred_purge", "0")
            .query_param_exists("request_id")
            .json_body(json!([item("/post/"), item("/post")]));
        then.status(200);
    });

    let pending = PendingPurgeList::new(Arc::new(MemoryTransientStore::new()));
    let service = cdn_service(&server, pending.clone());
    service
        .clear(&targets(&["https://example.com/post/?canonical=1&deleted"]))
        .await
        .expect("cdn purge");

    mock.assert();
}

#[tokio::test]
async fn missing_token_sends_nothing_and_keeps_urls_queued() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("POST").path("/purge");
        then.status(200);
    });

    let pending = PendingPurgeList::new(Arc::new(MemoryTransientStore::new()));
    let service = cdn_service_with_token(&server, pending.clone(), None);
    let result = service
        .clear(&targets(&["https://example.com/a/"]))
        .await;

    assert!(matches!(result, Err(PurgeError::Token(_))));
    assert_eq!(
        pending.load().expect("pending"),
        rendered(&["https://example.com/a/"])
    );
    mock.assert_hits(0);
}

#[tokio::test]
async fn cdn_failure_keeps_and_merges_pending_urls() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("POST").path("/purge");
        then.status(503).body("unavailable");
    });

    let pending = PendingPurgeList::new(Arc::new(MemoryTransientStore::new()));
    let service = cdn_service(&server, pending.clone());

    let first = service
        .clear(&targets(&["https://example.com/a/", "https://example.com/b/"]))
        .await;
    assert!(first.is_err());
    assert_eq!(
        sorted(pending.load().expect("pending")),
        rendered(&["https://example.com/a/", "https://example.com/b/"])
    );

    let second = service
        .clear(&targets(&["https://example.com/b/", "https://example.com/c/"]))
        .await;
    assert!(second.is_err());
    assert_eq!(
        sorted(pending.load().expect("pending")),
        rendered(&[
            "https://example.com/a/",
            "https://example.com/b/",
            "https://example.com/c/",
        ])
    );

    mock.assert_hits(2);
}

#[tokio::test]
async fn backlog_is_sent_with_the_next_successful_run() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method("POST").path("/purge");
        then.status(200);
    });

    let pending = PendingPurgeList::new(Arc::new(MemoryTransientStore::new()));
    pending
        .merge(&rendered(&["https://example.com/old/"]))
        .expect("seed backlog");

    let service = cdn_service(&server, pending.clone());
    service
        .clear(&targets(&["https://example.com/new/"]))
        .await
        .expect("cdn purge");

    mock.assert();
    assert!(pending.load().expect("pending").is_empty());
}

#[tokio::test]
async fn proxy_purge_removes_every_slot_for_a_post() {
    let dir = TempDir::new().expect("temp dir");
    let service = ProxyCachePurgeService::new(vec![dir.path().to_path_buf()], Device::ALL.to_vec());
    let target = PurgeUrl::parse("https://example.com/post/").expect("purge url");

    let mut files = Vec::new();
    for device in Device::ALL {
        files.extend(service.key_files(&target, dir.path(), device));
    }
    assert_eq!(files.len(), 32);
    for file in &files {
        fs::create_dir_all(file.parent().expect("parent")).expect("mkdir");
        fs::write(file, b"cached").expect("write slot");
    }
    let unrelated = dir.path().join("desktop").join("keep");
    fs::write(&unrelated, b"other").expect("write unrelated");

    service.clear(&[target]).await.expect("proxy purge");

    assert!(files.iter().all(|file| !file.exists()));
    assert!(unrelated.exists());
}

#[tokio::test]
async fn proxy_purge_all_for_device_drops_that_tree_only() {
    let dir = TempDir::new().expect("temp dir");
    let service = ProxyCachePurgeService::new(vec![dir.path().to_path_buf()], Device::ALL.to_vec());
    for device in Device::ALL {
        let slot = dir.path().join(device.as_str()).join("a").join("bc");
        fs::create_dir_all(&slot).expect("mkdir");
        fs::write(slot.join("abc"), b"cached").expect("write");
    }

    let target = PurgeUrl::parse("https://example.com/?purge_all=mobile").expect("purge url");
    service.clear(&[target]).await.expect("proxy purge");

    assert!(!dir.path().join("mobile").exists());
    assert!(dir.path().join("desktop").exists());
}

#[tokio::test]
async fn coordinator_reports_each_service_and_logs_the_run() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method("POST").path("/purge");
        then.status(500);
    });

    let dir = TempDir::new().expect("temp dir");
    let transients = Arc::new(MemoryTransientStore::new());
    let pending = PendingPurgeList::new(transients.clone());
    let services: Vec<Arc<dyn PurgeService>> = vec![
        Arc::new(ProxyCachePurgeService::new(
            vec![dir.path().to_path_buf()],
            Device::ALL.to_vec(),
        )),
        Arc::new(cdn_service(&server, pending.clone())),
    ];
    let coordinator = PurgeCoordinator::new(services, transients.clone());

    let report = coordinator
        .purge(&[
            "https://example.com/post/".to_string(),
            "https://example.com/post/".to_string(),
            "not a url".to_string(),
        ])
        .await;

    assert_eq!(report.urls.len(), 1);
    assert_eq!(report.rejected, vec!["not a url".to_string()]);
    assert_eq!(report.outcomes.len(), 2);
    assert!(report.outcomes[0].is_success());
    assert!(!report.outcomes[1].is_success());
    assert!(!report.is_success());
    assert_eq!(pending.load().expect("pending").len(), 1);

    let log = coordinator.log().expect("purge log");
    assert_eq!(log.len(), 1);
}
