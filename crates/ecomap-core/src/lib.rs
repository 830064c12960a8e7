//! EcoMap Core Library
//!
//! This crate provides shared configuration, client message types, errors,
//! and logging setup for the EcoMap offline controller.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{BypassConfig, ControllerConfig, LoaderSettings};
pub use error::{EcoMapError, EcoMapResult};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use types::{ClientBroadcast, ClientCommand, OfflinePayload};
