//! Messages exchanged between the controller and UI clients

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{EcoMapError, EcoMapResult};

/// Command sent by a UI client to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientCommand {
    /// Activate the waiting instance now, regardless of open clients.
    SkipWaiting,
}

impl ClientCommand {
    /// Validate a raw message payload.
    pub fn parse(raw: &str) -> EcoMapResult<Self> {
        serde_json::from_str(raw).map_err(|e| EcoMapError::message(e.to_string()))
    }
}

/// Message broadcast by the controller to UI clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientBroadcast {
    /// A new version took control. Clients should offer a reload.
    #[serde(rename = "NEW_VERSION_AVAILABLE")]
    UpdateAvailable {
        version: String,
        /// Milliseconds since the Unix epoch.
        timestamp: i64,
    },
}

impl ClientBroadcast {
    /// Build an update notice stamped with the current time.
    pub fn update_available(version: impl Into<String>) -> Self {
        Self::UpdateAvailable {
            version: version.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Version carried by the message.
    pub fn version(&self) -> &str {
        match self {
            Self::UpdateAvailable { version, .. } => version,
        }
    }

    /// Wire form of the message.
    pub fn to_json(&self) -> String {
        // A two-field enum with string/integer payload always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Body synthesized for live-only requests when the network is down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflinePayload {
    pub ok: bool,
    pub offline: bool,
    pub error: String,
}

impl OfflinePayload {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            offline: true,
            error: error.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}
