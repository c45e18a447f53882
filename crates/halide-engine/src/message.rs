//! Wire types exchanged with the host environment.
//!
//! Control messages arrive as JSON objects tagged by `action`; every
//! message gets a [`ControlResponse`]. The proxy types mirror the
//! request/response pair of the privileged cross-origin image fetcher.

use halide_pipeline::Settings;
use serde::{Deserialize, Serialize};

/// A command from the settings UI or another extension context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Replace the active settings.
    #[serde(rename_all = "camelCase")]
    ApplyFilter {
        /// Preset id (`"none"` disables the grade).
        preset: String,
        /// Add grain.
        #[serde(default)]
        grain_enabled: bool,
        /// Add a vignette.
        #[serde(default)]
        vignette_enabled: bool,
        /// Master switch.
        #[serde(default = "enabled_by_default")]
        pipeline_enabled: bool,
    },
    /// Force a full rescan and reprocess.
    Refresh,
    /// Liveness check.
    Ping,
}

const fn enabled_by_default() -> bool {
    true
}

impl ControlMessage {
    /// Parse a message from JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for unknown actions or malformed
    /// fields.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Settings carried by an `applyFilter` message.
    #[must_use]
    pub fn settings(&self) -> Option<Settings> {
        match self {
            Self::ApplyFilter {
                preset,
                grain_enabled,
                vignette_enabled,
                pipeline_enabled,
            } => Some(Settings {
                preset_id: preset.clone(),
                grain_enabled: *grain_enabled,
                vignette_enabled: *vignette_enabled,
                pipeline_enabled: *pipeline_enabled,
            }),
            Self::Refresh | Self::Ping => None,
        }
    }
}

/// Reply to a [`ControlMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Whether the message was handled.
    pub success: bool,
    /// Failure description when `success` is `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    /// A successful reply.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// A failed reply.
    #[must_use]
    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Request to the cross-origin image proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    /// The image the page could not read directly.
    pub image_url: String,
}

/// Reply from the cross-origin image proxy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    /// Whether the proxy fetched the image.
    pub success: bool,
    /// Same-origin `data:` URL of the image on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_url: Option<String>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
