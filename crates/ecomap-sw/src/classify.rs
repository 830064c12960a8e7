//! Request classification.
//!
//! A pure decision over URL, method and mode. The fetch handler branches on
//! the result; nothing here touches the network or the store.

use ecomap_core::{ControllerConfig, EcoMapResult};
use ecomap_net::{Request, RequestMode};
use hashbrown::HashSet;
use http::{HeaderMap, Method};
use url::{Origin, Url};

use crate::store::CacheKey;

/// Why a request is fetched live and never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// Path names a server-side script.
    ServerScript,
    /// Query names a server action.
    ServerAction,
    /// Third-party live data.
    LiveData,
}

/// Why a request is not intercepted at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    /// Not a `GET`.
    NonGet,
    /// Foreign origin that is not whitelisted.
    CrossOrigin,
}

/// Outcome of classifying one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Bypass(BypassReason),
    Shell,
    Runtime,
    PassThrough(PassReason),
}

impl Classification {
    /// Whether the controller answers the request itself.
    pub fn is_intercepted(&self) -> bool {
        !matches!(self, Classification::PassThrough(_))
    }

    /// Whether a response to this request may be stored.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Classification::Shell | Classification::Runtime)
    }
}

/// The parts of a request the classifier looks at.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
}

impl RequestDescriptor {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            mode: RequestMode::default(),
        }
    }
}

impl From<&Request> for RequestDescriptor {
    fn from(request: &Request) -> Self {
        Self {
            url: request.url.clone(),
            method: request.method.clone(),
            headers: request.headers.clone(),
            mode: request.mode,
        }
    }
}

/// Classifier for one controller release.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    origin: Origin,
    whitelisted: Vec<Origin>,
    live_data: Vec<Origin>,
    script_suffixes: Vec<String>,
    action_params: Vec<String>,
    shell: HashSet<String>,
}

impl RequestClassifier {
    pub fn new(config: &ControllerConfig) -> EcoMapResult<Self> {
        let shell = config
            .shell_urls()?
            .iter()
            .map(|url| CacheKey::get(url).url)
            .collect();

        Ok(Self {
            origin: config.origin.origin(),
            whitelisted: config
                .whitelisted_origins
                .iter()
                .map(Url::origin)
                .collect(),
            live_data: config
                .bypass
                .live_data_origins
                .iter()
                .map(Url::origin)
                .collect(),
            script_suffixes: config
                .bypass
                .script_suffixes
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            action_params: config.bypass.action_params.clone(),
            shell,
        })
    }

    /// Classify a request. Rules are checked in a fixed order; the first
    /// match wins.
    pub fn classify(&self, request: &RequestDescriptor) -> Classification {
        // Some mobile browsers mishandle intercepted non-GET requests, so
        // this comes before every other rule.
        if request.method != Method::GET {
            return Classification::PassThrough(PassReason::NonGet);
        }

        let origin = request.url.origin();
        if self.live_data.contains(&origin) {
            return Classification::Bypass(BypassReason::LiveData);
        }
        if origin != self.origin && !self.whitelisted.contains(&origin) {
            return Classification::PassThrough(PassReason::CrossOrigin);
        }

        let path = request.url.path().to_ascii_lowercase();
        if self
            .script_suffixes
            .iter()
            .any(|suffix| path.ends_with(suffix.as_str()))
        {
            return Classification::Bypass(BypassReason::ServerScript);
        }
        if request
            .url
            .query_pairs()
            .any(|(name, _)| self.action_params.iter().any(|p| *p == name))
        {
            return Classification::Bypass(BypassReason::ServerAction);
        }

        if self.shell.contains(&CacheKey::get(&request.url).url) {
            return Classification::Shell;
        }

        Classification::Runtime
    }
}
