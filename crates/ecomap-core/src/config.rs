//! Controller configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{EcoMapError, EcoMapResult};

/// Placeholder in shell paths that is replaced by the release version.
pub const VERSION_PLACEHOLDER: &str = "{version}";

/// Environment variable overriding [`ControllerConfig::version`].
pub const ENV_VERSION: &str = "ECOMAP_SW_VERSION";

/// Environment variable overriding [`ControllerConfig::origin`].
pub const ENV_ORIGIN: &str = "ECOMAP_SW_ORIGIN";

/// Offline controller configuration.
///
/// One value describes one release of the controller: its version tag, the
/// shell it must be able to boot from, and the rules deciding what is never
/// cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// The application's own origin. Only same-origin (or whitelisted)
    /// requests are ever stored.
    pub origin: Url,

    /// Release tag. Bumped on every deploy.
    pub version: String,

    /// Prefix of the shell store generation name.
    pub shell_prefix: String,

    /// Prefix of the runtime store generation name.
    pub runtime_prefix: String,

    /// Paths making up the offline-bootable shell. `{version}` is replaced
    /// by the release tag.
    pub shell_paths: Vec<String>,

    /// Document served for navigations while offline.
    pub entry_document: String,

    /// Requests that are always fetched live.
    pub bypass: BypassConfig,

    /// Foreign origins treated like the app origin.
    pub whitelisted_origins: Vec<Url>,

    /// SQLite file holding the store generations. In-memory when unset.
    pub store_path: Option<PathBuf>,

    /// Network client settings.
    pub loader: LoaderSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassConfig {
    /// Path suffixes of server-side scripts.
    pub script_suffixes: Vec<String>,

    /// Query parameters naming a server action.
    pub action_params: Vec<String>,

    /// Third-party origins serving live data.
    pub live_data_origins: Vec<Url>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    /// User agent string
    pub user_agent: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum redirects followed
    pub max_redirects: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            origin: static_url("https://ecomap.saltacoders.com/"),
            version: "3".to_string(),
            shell_prefix: "ecomap-shell".to_string(),
            runtime_prefix: "ecomap-runtime".to_string(),
            shell_paths: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json?v={version}".to_string(),
                "/icon-192.svg?v={version}".to_string(),
                "/icon-512.svg?v={version}".to_string(),
            ],
            entry_document: "/index.html".to_string(),
            bypass: BypassConfig::default(),
            whitelisted_origins: Vec::new(),
            store_path: None,
            loader: LoaderSettings::default(),
        }
    }
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            script_suffixes: vec![".php".to_string()],
            action_params: vec!["action".to_string()],
            live_data_origins: vec![
                static_url("https://api.open-meteo.com/"),
                static_url("https://ws.smn.gob.ar/"),
            ],
        }
    }
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            user_agent: format!("EcoMap-SW/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
            max_redirects: 10,
        }
    }
}

impl ControllerConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> EcoMapResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn from_file(path: &Path) -> EcoMapResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Apply `ECOMAP_SW_VERSION` / `ECOMAP_SW_ORIGIN` from the environment.
    pub fn apply_env_overrides(&mut self) -> EcoMapResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> EcoMapResult<()> {
        if let Some(version) = lookup(ENV_VERSION) {
            self.version = version;
        }
        if let Some(origin) = lookup(ENV_ORIGIN) {
            self.origin = Url::parse(&origin)?;
        }
        self.validate()
    }

    /// Check the configuration for values the controller cannot work with.
    pub fn validate(&self) -> EcoMapResult<()> {
        if self.version.trim().is_empty() {
            return Err(EcoMapError::config("version must not be empty"));
        }
        if self.origin.cannot_be_a_base() || self.origin.host_str().is_none() {
            return Err(EcoMapError::config(format!(
                "origin {} is not a hierarchical URL",
                self.origin
            )));
        }
        if self.origin.path() != "/" {
            return Err(EcoMapError::config(format!(
                "origin {} must not carry a path",
                self.origin
            )));
        }
        if self.shell_paths.is_empty() {
            return Err(EcoMapError::config("shell must list at least one path"));
        }
        if self.shell_prefix == self.runtime_prefix {
            return Err(EcoMapError::config(
                "shell and runtime store prefixes must differ",
            ));
        }
        Ok(())
    }

    /// Name of this release's shell store generation.
    pub fn shell_store_name(&self) -> String {
        format!("{}-{}", self.shell_prefix, self.version)
    }

    /// Name of this release's runtime store generation.
    pub fn runtime_store_name(&self) -> String {
        format!("{}-{}", self.runtime_prefix, self.version)
    }

    /// Absolute shell URLs with the version tag filled in.
    pub fn shell_urls(&self) -> EcoMapResult<Vec<Url>> {
        self.shell_paths
            .iter()
            .map(|path| {
                let path = path.replace(VERSION_PLACEHOLDER, &self.version);
                Ok(self.origin.join(&path)?)
            })
            .collect()
    }

    /// Absolute URL of the offline entry document.
    pub fn entry_document_url(&self) -> EcoMapResult<Url> {
        let path = self.entry_document.replace(VERSION_PLACEHOLDER, &self.version);
        Ok(self.origin.join(&path)?)
    }
}

fn static_url(url: &str) -> Url {
    // Only called with literals above.
    Url::parse(url).unwrap_or_else(|e| panic!("invalid built-in URL {url}: {e}"))
}
