//! Fetch serving policy.
//!
//! One [`ServingPolicy`] exists per active instance. It owns nothing mutable,
//! so any number of fetches can run through it at once; the store is the only
//! shared resource.

use std::sync::Arc;

use bytes::Bytes;
use ecomap_core::{ControllerConfig, OfflinePayload};
use ecomap_net::{CacheMode, Fetcher, Request, Response};
use http::{Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::classify::{Classification, RequestClassifier, RequestDescriptor};
use crate::store::{CacheEntry, CacheKey, CacheStorage};
use crate::ServiceWorkerError;

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// Built by the controller (offline payload, network error).
    Synthesized,
}

/// Response handed back to the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Status code. 0 for a network error.
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl FetchResponse {
    /// Create a network error response.
    pub fn network_error() -> Self {
        Self {
            status: 0,
            status_text: "Network Error".to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
            source: ResponseSource::Synthesized,
        }
    }

    /// Create a response from cache entry.
    pub fn from_cache(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status,
            status_text: entry.status_text.clone(),
            headers: entry.headers.clone(),
            body: Bytes::from(entry.body.clone()),
            source: ResponseSource::Cache,
        }
    }

    /// Create a response from a live network response.
    pub fn from_network(response: Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            status: response.status.as_u16(),
            status_text: response
                .status
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
            headers,
            body: response.bytes(),
            source: ResponseSource::Network,
        }
    }

    /// Offline indicator for live-only requests.
    pub fn offline(error: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            status_text: "Service Unavailable".to_string(),
            headers: vec![(
                "content-type".to_string(),
                "application/json".to_string(),
            )],
            body: Bytes::from(OfflinePayload::new(error).to_bytes()),
            source: ResponseSource::Synthesized,
        }
    }

    pub fn is_network_error(&self) -> bool {
        self.status == 0
    }

    /// First header value with `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// How one active instance answers intercepted requests.
pub struct ServingPolicy {
    classifier: RequestClassifier,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    shell_store: String,
    runtime_store: String,
    entry_document: Url,
}

impl ServingPolicy {
    pub fn new(
        config: &ControllerConfig,
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        Ok(Self {
            classifier: RequestClassifier::new(config)?,
            storage,
            fetcher,
            shell_store: config.shell_store_name(),
            runtime_store: config.runtime_store_name(),
            entry_document: config.entry_document_url()?,
        })
    }

    pub fn classify(&self, request: &Request) -> Classification {
        self.classifier.classify(&RequestDescriptor::from(request))
    }

    /// Answer a request. `None` means it is not intercepted and the host
    /// should handle it as if no controller were installed.
    pub async fn respond(&self, request: Request) -> Option<FetchResponse> {
        let classification = self.classify(&request);
        debug!(url = %request.url, method = %request.method, ?classification, "Fetch intercepted");

        if !classification.is_intercepted() {
            return None;
        }

        let response = if !classification.is_cacheable() {
            self.live(request).await
        } else if request.is_navigation() {
            self.network_first(request).await
        } else {
            self.cache_first(request).await
        };
        Some(response)
    }

    /// Live fetch with every HTTP cache disabled; never stored.
    async fn live(&self, request: Request) -> FetchResponse {
        let url = request.url.clone();
        match self.fetcher.fetch(request.cache(CacheMode::NoStore)).await {
            Ok(response) => FetchResponse::from_network(response),
            Err(e) => {
                warn!(url = %url, error = %e, "Live request failed, answering offline");
                FetchResponse::offline(e.to_string())
            }
        }
    }

    /// Documents: the network wins whenever it answers.
    async fn network_first(&self, request: Request) -> FetchResponse {
        let url = request.url.clone();
        match self.fetcher.fetch(request).await {
            Ok(response) => FetchResponse::from_network(response),
            Err(e) => {
                debug!(url = %url, error = %e, "Navigation failed, falling back to shell");
                let key = CacheKey::get(&self.entry_document);
                self.lookup(&self.shell_store, &key)
                    .map(|entry| FetchResponse::from_cache(&entry))
                    .unwrap_or_else(FetchResponse::network_error)
            }
        }
    }

    /// Assets: stored copy first, then the network, storing what comes back.
    async fn cache_first(&self, request: Request) -> FetchResponse {
        let key = CacheKey::new(&request.method, &request.url);
        let cached = self
            .lookup(&self.shell_store, &key)
            .or_else(|| self.lookup(&self.runtime_store, &key));
        if let Some(entry) = cached {
            return FetchResponse::from_cache(&entry);
        }

        let url = request.url.clone();
        let is_get = request.method == Method::GET;
        let response = match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %url, error = %e, "Fetch failed with nothing cached");
                return FetchResponse::network_error();
            }
        };

        if !(is_get && response.status == StatusCode::OK) {
            return FetchResponse::from_network(response);
        }

        let (to_store, to_return) = response.tee();
        let entry = CacheEntry::from_response(&key, to_store);
        if let Err(e) = self.storage.put(&self.runtime_store, &entry) {
            warn!(url = %url, store = %self.runtime_store, error = %e, "Failed to store response");
        }
        FetchResponse::from_network(to_return)
    }

    fn lookup(&self, store: &str, key: &CacheKey) -> Option<CacheEntry> {
        match self.storage.match_request(store, key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(store = %store, url = %key.url, error = %e, "Store read failed");
                None
            }
        }
    }
}
