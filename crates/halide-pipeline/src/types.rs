//! Shared types for the halide pixel pipeline.

use serde::{Deserialize, Serialize};

/// Re-export `RgbaImage` so downstream crates can hand pixel buffers
/// to the pipeline without depending on `image` directly.
pub use image::RgbaImage;

/// Preset identifier that selects "no film emulation".
///
/// A settings snapshot carrying this preset is the identity transform:
/// no LUT, no grain, no vignette.
pub const PRESET_NONE: &str = "none";

/// User-facing settings snapshot.
///
/// Immutable value: a settings change replaces the whole snapshot, and
/// every job closes over the snapshot that was active when it was
/// dispatched. Field names serialize in camelCase to match the settings
/// store and control messages (`presetId`, `grainEnabled`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Which LUT preset to apply, or [`PRESET_NONE`].
    pub preset_id: String,
    /// Whether to add film grain after the color transform.
    #[serde(default)]
    pub grain_enabled: bool,
    /// Whether to darken the corners after the color transform.
    #[serde(default)]
    pub vignette_enabled: bool,
    /// Master switch. When `false` every transformed surface is reverted.
    #[serde(default = "default_pipeline_enabled")]
    pub pipeline_enabled: bool,
}

const fn default_pipeline_enabled() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            preset_id: PRESET_NONE.to_owned(),
            grain_enabled: false,
            vignette_enabled: false,
            pipeline_enabled: true,
        }
    }
}

impl Settings {
    /// Returns `true` if this snapshot selects the "none" preset.
    #[must_use]
    pub fn is_none_preset(&self) -> bool {
        self.preset_id == PRESET_NONE
    }

    /// Returns `true` when surfaces should carry a transform at all:
    /// the pipeline is enabled and a real preset is selected.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.pipeline_enabled && !self.preset_id.is_empty() && !self.is_none_preset()
    }
}

/// Strength parameters for the post-LUT effects.
///
/// These are process-wide tuning knobs, not per-user settings: the user
/// only toggles grain/vignette on and off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EffectParams {
    /// Grain amplitude as a fraction of the full 0-255 range.
    pub grain_intensity: f32,
    /// Peak vignette opacity at the outer radius (0.0 to 1.0).
    pub vignette_amount: f32,
}

impl EffectParams {
    /// Default grain intensity.
    pub const DEFAULT_GRAIN_INTENSITY: f32 = 0.08;
    /// Default vignette amount.
    pub const DEFAULT_VIGNETTE_AMOUNT: f32 = 0.35;
}

impl Default for EffectParams {
    fn default() -> Self {
        Self {
            grain_intensity: Self::DEFAULT_GRAIN_INTENSITY,
            vignette_amount: Self::DEFAULT_VIGNETTE_AMOUNT,
        }
    }
}

/// What a single [`render`](crate::render) call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderStats {
    /// Whether the LUT pass ran.
    pub lut_applied: bool,
    /// Whether grain was added.
    pub grain_applied: bool,
    /// Whether the vignette was composited.
    pub vignette_applied: bool,
    /// Number of pixels in the buffer.
    pub pixel_count: u64,
}

/// Errors produced while parsing or validating a LUT.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LutError {
    /// The text contained no color rows.
    #[error("LUT contains no color rows")]
    Empty,

    /// The declared or inferred grid size is outside the supported range.
    #[error("LUT size {0} is outside the supported range 2..=256")]
    InvalidSize(usize),

    /// No size directive and the row count matches no plausible cube.
    #[error("cannot infer a LUT size from {rows} rows")]
    UnknownSize {
        /// Number of color rows found.
        rows: usize,
    },

    /// A size directive without a usable value.
    #[error("line {line}: malformed size directive")]
    MalformedDirective {
        /// 1-based line number.
        line: usize,
    },

    /// A data row that is not exactly three finite numbers.
    #[error("line {line}: expected three numeric components")]
    MalformedRow {
        /// 1-based line number.
        line: usize,
    },

    /// Row count differs from `size³` by more than the repair slack.
    #[error("expected {expected} rows for the declared size, found {found}")]
    RowCountMismatch {
        /// `size³`.
        expected: usize,
        /// Rows actually present.
        found: usize,
    },

    /// A valid CUBE feature this pipeline does not handle.
    #[error("unsupported LUT: {0}")]
    Unsupported(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn settings_default_is_inactive() {
        let settings = Settings::default();
        assert!(settings.is_none_preset());
        assert!(!settings.is_active());
    }

    #[test]
    fn settings_active_requires_enabled_and_preset() {
        let mut settings = Settings {
            preset_id: "portra-400".into(),
            ..Settings::default()
        };
        assert!(settings.is_active());

        settings.pipeline_enabled = false;
        assert!(!settings.is_active());

        settings.pipeline_enabled = true;
        settings.preset_id = String::new();
        assert!(!settings.is_active());
    }

    #[test]
    fn settings_deserialize_camel_case() {
        let json = r#"{"presetId":"kodachrome","grainEnabled":true,"vignetteEnabled":false,"pipelineEnabled":true}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.preset_id, "kodachrome");
        assert!(settings.grain_enabled);
        assert!(!settings.vignette_enabled);
        assert!(settings.pipeline_enabled);
    }

    #[test]
    fn settings_missing_flags_use_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"presetId":"velvia"}"#).unwrap();
        assert!(!settings.grain_enabled);
        assert!(!settings.vignette_enabled);
        assert!(settings.pipeline_enabled);
    }

    #[test]
    fn effect_params_partial_json_keeps_defaults() {
        let params: EffectParams = serde_json::from_str(r#"{"grainIntensity":0.2}"#).unwrap();
        assert!((params.grain_intensity - 0.2).abs() < f32::EPSILON);
        assert!(
            (params.vignette_amount - EffectParams::DEFAULT_VIGNETTE_AMOUNT).abs() < f32::EPSILON
        );
    }

    #[test]
    fn lut_error_display() {
        let err = LutError::RowCountMismatch {
            expected: 8,
            found: 40,
        };
        assert_eq!(
            err.to_string(),
            "expected 8 rows for the declared size, found 40"
        );
        assert_eq!(
            LutError::MalformedRow { line: 7 }.to_string(),
            "line 7: expected three numeric components"
        );
    }
}
