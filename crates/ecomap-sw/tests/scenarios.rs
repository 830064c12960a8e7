//! End-to-end controller scenarios against a scripted network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ecomap_core::{ClientBroadcast, ControllerConfig};
use ecomap_net::{CacheMode, Fetcher, NetError, Request, Response};
use ecomap_sw::{
    CacheStorage, ClientType, ControllerHandle, RegistrationSnapshot, ResponseSource,
    ServiceWorkerController, ServiceWorkerEvent,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tokio::sync::mpsc;
use url::Url;

const ORIGIN: &str = "https://ecomap.test/";

/// Network double: fixed routes, a default body per URL, and an off switch.
#[derive(Default)]
struct ScriptedNetwork {
    offline: AtomicBool,
    routes: Mutex<HashMap<String, (StatusCode, &'static str)>>,
    log: Mutex<Vec<(Method, String, CacheMode)>>,
}

impl ScriptedNetwork {
    fn route(&self, url: &str, status: StatusCode, body: &'static str) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body));
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn calls_to(&self, url: &str) -> Vec<CacheMode> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, u, _)| u == url)
            .map(|(_, _, cache)| *cache)
            .collect()
    }
}

#[async_trait]
impl Fetcher for ScriptedNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.log.lock().unwrap().push((
            request.method.clone(),
            request.url.to_string(),
            request.cache,
        ));
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("network unreachable".to_string()));
        }

        let route = self.routes.lock().unwrap().get(request.url.as_str()).copied();
        let (status, body) = match route {
            Some((status, body)) => (status, Bytes::from_static(body.as_bytes())),
            None => (StatusCode::OK, Bytes::from(format!("body of {}", request.url))),
        };
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        Ok(Response::new(request.url, status, headers, body))
    }
}

struct Harness {
    network: Arc<ScriptedNetwork>,
    storage: CacheStorage,
    handle: ControllerHandle,
    events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
}

impl Harness {
    fn new() -> Self {
        Self::with_storage(CacheStorage::in_memory().unwrap())
    }

    fn with_storage(storage: CacheStorage) -> Self {
        let network = Arc::new(ScriptedNetwork::default());
        let (handle, events) = ServiceWorkerController::spawn(storage.clone(), network.clone());
        Self {
            network,
            storage,
            handle,
            events,
        }
    }

    async fn wait(
        &self,
        predicate: impl FnMut(&RegistrationSnapshot) -> bool,
    ) -> RegistrationSnapshot {
        tokio::time::timeout(Duration::from_secs(5), self.handle.wait_for(predicate))
            .await
            .expect("timed out waiting for registration state")
            .unwrap()
    }

    async fn activate(&self, version: &str) {
        self.handle.register(config(version)).await.unwrap();
        self.wait(|s| s.is_activated(version)).await;
    }

    fn total_entries(&self) -> usize {
        self.storage
            .keys()
            .unwrap()
            .iter()
            .map(|store| self.storage.entry_keys(store).unwrap().len())
            .sum()
    }
}

fn config(version: &str) -> ControllerConfig {
    ControllerConfig {
        origin: Url::parse(ORIGIN).unwrap(),
        version: version.to_string(),
        ..Default::default()
    }
}

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn get(path: &str) -> Request {
    Request::get(url(path))
}

#[tokio::test]
async fn shell_entries_reread_offline_unchanged() {
    let h = Harness::new();
    h.activate("3").await;
    h.network.set_offline(true);

    for shell_url in config("3").shell_urls().unwrap() {
        let expected = Bytes::from(format!("body of {}", shell_url));
        for _ in 0..2 {
            let response = h
                .handle
                .handle_fetch(Request::get(shell_url.clone()))
                .await
                .unwrap();
            assert_eq!(response.source, ResponseSource::Cache);
            assert_eq!(response.status, 200);
            assert_eq!(response.body, expected);
        }
    }
}

#[tokio::test]
async fn non_get_requests_are_never_intercepted() {
    let h = Harness::new();
    h.activate("3").await;
    let before = h.total_entries();

    for method in [Method::POST, Method::PUT, Method::DELETE] {
        let mut request = get("/api.php");
        request.method = method;
        assert!(h.handle.handle_fetch(request).await.is_none());

        let mut request = get("/index.html");
        request.method = Method::POST;
        assert!(h.handle.handle_fetch(request).await.is_none());
    }

    assert!(h.network.calls_to(url("/api.php").as_str()).is_empty());
    assert_eq!(h.total_entries(), before);
}

#[tokio::test]
async fn bypassed_requests_leave_no_entries() {
    let h = Harness::new();
    h.activate("3").await;
    let before = h.total_entries();

    let live = [
        "https://ecomap.test/api.php",
        "https://ecomap.test/reports?action=get_points",
        "https://api.open-meteo.com/v1/forecast?latitude=-24.78",
    ];

    for target in live {
        let request = Request::get(Url::parse(target).unwrap());
        let response = h.handle.handle_fetch(request).await.unwrap();
        assert_eq!(response.source, ResponseSource::Network);
    }

    h.network.set_offline(true);
    for target in live {
        let request = Request::get(Url::parse(target).unwrap());
        let response = h.handle.handle_fetch(request).await.unwrap();
        assert_eq!(response.status, 503);
        let payload: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(payload["ok"], false);
        assert_eq!(payload["offline"], true);
        assert!(payload["error"].is_string());
    }

    assert_eq!(h.total_entries(), before);
}

#[tokio::test]
async fn runtime_entries_served_byte_for_byte_offline() {
    let h = Harness::new();
    h.activate("3").await;
    h.network.route(
        url("/assets/index-4f2a.js").as_str(),
        StatusCode::OK,
        "console.log('ecomap')",
    );

    let online = h.handle.handle_fetch(get("/assets/index-4f2a.js")).await.unwrap();
    assert_eq!(online.source, ResponseSource::Network);

    h.network.set_offline(true);
    let offline = h.handle.handle_fetch(get("/assets/index-4f2a.js")).await.unwrap();
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.body, online.body);
    assert_eq!(offline.status, online.status);
    assert_eq!(offline.header("content-type"), Some("text/plain"));

    // Never fetched and nothing stored: a network error, not a fallback.
    let missing = h.handle.handle_fetch(get("/assets/other.js")).await.unwrap();
    assert!(missing.is_network_error());
}

#[tokio::test]
async fn scenario_first_visit_then_offline_navigation() {
    let h = Harness::new();
    h.network.route(url("/index.html").as_str(), StatusCode::OK, "<html>ecomap</html>");
    h.activate("7").await;

    for path in [
        "/",
        "/index.html",
        "/manifest.json?v=7",
        "/icon-192.svg?v=7",
        "/icon-512.svg?v=7",
    ] {
        assert_eq!(h.network.calls_to(url(path).as_str()).len(), 1, "{path}");
    }
    assert_eq!(h.storage.entry_keys("ecomap-shell-7").unwrap().len(), 5);

    h.network.set_offline(true);
    let response = h
        .handle
        .handle_fetch(Request::navigate(url("/")))
        .await
        .unwrap();
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.body, Bytes::from_static(b"<html>ecomap</html>"));
}

#[tokio::test]
async fn scenario_new_version_waits_then_takes_over() {
    let mut h = Harness::new();
    h.activate("1").await;

    let (_, mut tab) = h
        .handle
        .open_client(url("/"), ClientType::Window)
        .await
        .unwrap();

    h.handle.register(config("2")).await.unwrap();
    let snapshot = h.wait(|s| s.waiting_version() == Some("2")).await;
    assert_eq!(snapshot.active_version(), Some("1"));
    assert!(h.storage.has("ecomap-shell-1").unwrap());
    assert!(h.storage.has("ecomap-shell-2").unwrap());

    // The open tab is still served by the first release.
    h.network.set_offline(true);
    let manifest = h
        .handle
        .handle_fetch(get("/manifest.json?v=1"))
        .await
        .unwrap();
    assert_eq!(manifest.source, ResponseSource::Cache);
    h.network.set_offline(false);

    h.handle
        .post_message(r#"{"type":"SKIP_WAITING"}"#)
        .await
        .unwrap();
    h.wait(|s| s.is_activated("2")).await;

    assert!(!h.storage.has("ecomap-shell-1").unwrap());
    assert!(h.storage.has("ecomap-shell-2").unwrap());

    let broadcast = tab.recv().await.unwrap();
    assert!(matches!(
        broadcast,
        ClientBroadcast::UpdateAvailable { ref version, timestamp } if version == "2" && timestamp > 0
    ));

    let mut claimed = false;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, ServiceWorkerEvent::ControllerChange { claimed: 1, .. }) {
            claimed = true;
        }
    }
    assert!(claimed);
}

#[tokio::test]
async fn scenario_closing_last_tab_activates_waiting() {
    let h = Harness::new();
    h.activate("1").await;
    let (tab, _rx) = h
        .handle
        .open_client(url("/"), ClientType::Window)
        .await
        .unwrap();

    h.handle.register(config("2")).await.unwrap();
    h.wait(|s| s.waiting_version() == Some("2")).await;

    assert!(h.handle.close_client(tab).await.unwrap());
    h.wait(|s| s.is_activated("2")).await;
    assert!(!h.storage.has("ecomap-shell-1").unwrap());
}

#[tokio::test]
async fn scenario_server_requests_fetched_live_every_time() {
    let h = Harness::new();
    h.activate("3").await;

    for target in ["/api.php", "/reports?action=get_points"] {
        for _ in 0..2 {
            let response = h.handle.handle_fetch(get(target)).await.unwrap();
            assert_eq!(response.source, ResponseSource::Network);
        }
        let calls = h.network.calls_to(url(target).as_str());
        assert_eq!(calls, vec![CacheMode::NoStore, CacheMode::NoStore]);
    }

    assert!(!h.storage.has("ecomap-runtime-3").unwrap());
}

#[tokio::test]
async fn scenario_post_behaves_as_uncontrolled() {
    let h = Harness::new();
    h.activate("3").await;

    let request = Request::post(url("/api.php?action=add_point"), Bytes::from_static(b"{}"));
    assert!(h.handle.handle_fetch(request).await.is_none());
    assert!(h
        .network
        .calls_to(url("/api.php?action=add_point").as_str())
        .is_empty());
}

#[tokio::test]
async fn failed_install_stores_nothing() {
    let mut h = Harness::new();
    h.network.route(
        url("/icon-512.svg?v=5").as_str(),
        StatusCode::INTERNAL_SERVER_ERROR,
        "boom",
    );

    h.handle.register(config("5")).await.unwrap();
    let reason = loop {
        match h.events.recv().await.unwrap() {
            ServiceWorkerEvent::InstallFailed { reason, .. } => break reason,
            _ => continue,
        }
    };
    assert!(reason.contains("500"));

    let snapshot = h.wait(|s| s.installing.is_none()).await;
    assert!(snapshot.active.is_none());
    assert!(h.storage.keys().unwrap().is_empty());

    // Nothing active, so nothing is intercepted.
    assert!(h.handle.handle_fetch(get("/")).await.is_none());
}

#[tokio::test]
async fn clear_caches_removes_every_generation() {
    let h = Harness::new();
    h.activate("3").await;
    h.handle.handle_fetch(get("/assets/app.css")).await.unwrap();
    assert_eq!(h.storage.keys().unwrap().len(), 2);

    assert_eq!(h.handle.clear_caches().await.unwrap(), 2);
    assert!(h.storage.keys().unwrap().is_empty());
}

#[tokio::test]
async fn dropped_tab_does_not_hold_back_update() {
    let h = Harness::new();
    h.activate("1").await;

    let (_, tab) = h
        .handle
        .open_client(url("/"), ClientType::Window)
        .await
        .unwrap();
    assert_eq!(h.handle.status().open_clients, 1);
    // The page went away without a close notification.
    drop(tab);

    h.handle.register(config("2")).await.unwrap();
    let snapshot = h.wait(|s| s.is_activated("2")).await;
    assert!(snapshot.waiting.is_none());
    assert_eq!(snapshot.open_clients, 0);
    assert!(!h.storage.has("ecomap-shell-1").unwrap());
}

#[tokio::test]
async fn failed_store_cleanup_does_not_block_activation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stores.db");
    let h = Harness::with_storage(CacheStorage::open_path(&path).unwrap());
    h.activate("1").await;
    h.handle.handle_fetch(get("/assets/app.js")).await.unwrap();
    assert!(h.storage.has("ecomap-runtime-1").unwrap());

    // Make deleting the old shell fail from outside the controller.
    let other = rusqlite::Connection::open(&path).unwrap();
    other
        .execute_batch(
            "CREATE TRIGGER pin_shell BEFORE DELETE ON stores
             WHEN OLD.name = 'ecomap-shell-1'
             BEGIN SELECT RAISE(ABORT, 'pinned'); END;",
        )
        .unwrap();
    drop(other);

    h.handle.register(config("2")).await.unwrap();
    h.wait(|s| s.is_activated("2")).await;

    assert!(h.storage.has("ecomap-shell-1").unwrap());
    assert!(!h.storage.has("ecomap-runtime-1").unwrap());

    h.network.set_offline(true);
    let manifest = h
        .handle
        .handle_fetch(get("/manifest.json?v=2"))
        .await
        .unwrap();
    assert_eq!(manifest.source, ResponseSource::Cache);
    assert_eq!(
        manifest.body,
        Bytes::from(format!("body of {}", url("/manifest.json?v=2")))
    );
}
