//! EcoMap smoke harness.
//!
//! Drives the offline controller against the real network and prints one
//! JSON object per result line.
//!
//! ## Usage
//!
//! ```bash
//! # Install the shell for the configured release
//! ecomap-smoke --config ecomap.json install
//!
//! # Install, then fetch through the controller
//! ecomap-smoke fetch https://ecomap.saltacoders.com/ https://ecomap.saltacoders.com/api.php
//!
//! # List store generations in a persistent store
//! ecomap-smoke --store cache.db stores
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ecomap_core::{init_logging, ControllerConfig, LogConfig, LogFormat};
use ecomap_net::{LoaderConfig, Request, ResourceLoader};
use ecomap_sw::{
    CacheStorage, ControllerHandle, ServiceWorkerController, ServiceWorkerEvent,
    ServiceWorkerState, WorkerId,
};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;
use url::Url;

#[derive(Parser)]
#[command(name = "ecomap-smoke")]
#[command(about = "Smoke harness for the EcoMap offline controller")]
struct Cli {
    /// Controller configuration (JSON). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite store file, overriding the configuration.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Log filter, e.g. "ecomap_sw=debug".
    #[arg(long, global = true)]
    log: Option<String>,

    /// Seconds to wait for installation.
    #[arg(long, global = true, default_value = "60")]
    install_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate the configured release
    Install,

    /// Install, then fetch URLs through the controller
    Fetch {
        /// URLs to request
        #[arg(required = true)]
        urls: Vec<Url>,
        /// Issue the requests as document navigations
        #[arg(long)]
        navigate: bool,
    },

    /// List store generations and their entry counts
    Stores,

    /// Delete every store generation
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig {
        format: if cli.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Compact
        },
        ..Default::default()
    };
    if let Some(filter) = cli.log.clone() {
        log_config = log_config.with_filter(filter);
    }
    init_logging(log_config);

    let config = load_config(&cli)?;
    let storage = match config.store_path {
        Some(ref path) => CacheStorage::open_path(path)
            .with_context(|| format!("opening store {}", path.display()))?,
        None => CacheStorage::in_memory()?,
    };

    match cli.command {
        Commands::Stores => {
            for name in storage.keys()? {
                let entries = storage.entry_keys(&name)?.len();
                println!("{}", json!({ "store": name, "entries": entries }));
            }
            return Ok(());
        }
        Commands::Clear => {
            let removed = storage.clear_all()?;
            println!("{}", json!({ "cleared": removed }));
            return Ok(());
        }
        Commands::Install | Commands::Fetch { .. } => {}
    }

    let loader = ResourceLoader::new(LoaderConfig::from(&config.loader))?;
    let (handle, mut events) = ServiceWorkerController::spawn(storage, Arc::new(loader));

    let started = Instant::now();
    let version = config.version.clone();
    let worker = handle.register(config).await?;
    tokio::time::timeout(
        Duration::from_secs(cli.install_timeout),
        wait_for_activation(worker, &mut events),
    )
    .await
    .context("timed out waiting for installation")??;

    let status = handle.status();
    println!(
        "{}",
        json!({
            "installed": version,
            "worker": worker.raw(),
            "shell_store": status.active.as_ref().map(|i| i.shell_store.clone()),
            "elapsed_ms": started.elapsed().as_millis() as u64,
        })
    );

    if let Commands::Fetch { urls, navigate } = cli.command {
        fetch_all(&handle, urls, navigate).await;
    }

    handle.shutdown();
    Ok(())
}

fn load_config(cli: &Cli) -> Result<ControllerConfig> {
    let mut config = match cli.config {
        Some(ref path) => ControllerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(ref store) = cli.store {
        config.store_path = Some(store.clone());
    }
    info!(origin = %config.origin, version = %config.version, "Configuration loaded");
    Ok(config)
}

/// Wait until `worker` is activated, or fail with its install error.
async fn wait_for_activation(
    worker: WorkerId,
    events: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            ServiceWorkerEvent::StateChange {
                worker: w,
                state: ServiceWorkerState::Activated,
                ..
            } if w == worker => return Ok(()),
            ServiceWorkerEvent::InstallFailed { worker: w, reason } if w == worker => {
                bail!("install failed: {reason}")
            }
            _ => {}
        }
    }
    bail!("controller stopped before activation")
}

async fn fetch_all(handle: &ControllerHandle, urls: Vec<Url>, navigate: bool) {
    for url in urls {
        let request = if navigate {
            Request::navigate(url.clone())
        } else {
            Request::get(url.clone())
        };

        let started = Instant::now();
        let line = match handle.handle_fetch(request).await {
            Some(response) => json!({
                "url": url.as_str(),
                "intercepted": true,
                "status": response.status,
                "source": format!("{:?}", response.source),
                "bytes": response.body.len(),
                "elapsed_ms": started.elapsed().as_millis() as u64,
            }),
            None => json!({
                "url": url.as_str(),
                "intercepted": false,
            }),
        };
        println!("{line}");
    }
}
