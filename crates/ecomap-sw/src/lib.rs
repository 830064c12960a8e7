//! # EcoMap Service Worker
//!
//! Offline cache and update-lifecycle controller for the EcoMap PWA.
//!
//! ## Features
//!
//! - **Classification**: every outbound request is bypassed, served from the
//!   shell, cached at runtime, or left alone
//! - **Lifecycle**: install, wait, activate, retire, as an explicit state machine
//! - **Cache storage**: versioned store generations persisted in SQLite
//! - **Clients**: update broadcasts to every open window
//! - **Fetch interception**: network-first documents, cache-first assets
//!
//! ## Architecture
//!
//! ```text
//! ControllerHandle ── mpsc ──► controller task
//!     │                           ├── RegistrationState (installing / waiting / active)
//!     │                           └── Clients ──► UpdateAvailable broadcasts
//!     │
//!     └── handle_fetch ── RequestClassifier ──► policy
//!                                                 ├── Fetcher (network)
//!                                                 └── CacheStorage
//!                                                        └── shell-N / runtime-N
//! ```

use thiserror::Error;

pub mod classify;
pub mod clients;
pub mod controller;
pub mod lifecycle;
pub mod policy;
pub mod store;

pub use classify::{BypassReason, Classification, PassReason, RequestClassifier, RequestDescriptor};
pub use clients::{Client, ClientId, ClientMatchOptions, ClientType, Clients};
pub use controller::{ControllerHandle, RegistrationSnapshot, ServiceWorkerController, ServiceWorkerEvent};
pub use lifecycle::{
    transition, Effect, LifecycleEvent, RegistrationState, ServiceWorkerState, WorkerId,
    WorkerInstance,
};
pub use policy::{FetchResponse, ResponseSource, ServingPolicy};
pub use store::{CacheEntry, CacheKey, CacheStorage};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] ecomap_net::NetError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Store error: {0}")]
    StoreError(#[from] rusqlite::Error),

    #[error("Store lock poisoned")]
    StorePoisoned,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ecomap_core::EcoMapError),

    #[error("Controller is shut down")]
    Shutdown,
}
