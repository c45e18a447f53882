//! One full grade: LUT, then grain, then vignette.

use std::sync::Arc;

use tracing::trace;

use crate::lut::LutTable;
use crate::types::{EffectParams, RenderStats, RgbaImage, Settings};
use crate::{color, grain, vignette};

/// Everything needed to render one surface, resolved from a settings
/// snapshot.
///
/// A grade without a LUT is the identity: the "none" preset changes
/// nothing, not even when grain or vignette are toggled on.
#[derive(Debug, Clone, Default)]
pub struct Grade {
    lut: Option<Arc<LutTable>>,
    grain_intensity: Option<f32>,
    vignette_amount: Option<f32>,
}

impl Grade {
    /// Resolve a grade from `settings`.
    ///
    /// `lut` is the parsed table for `settings.preset_id`, or `None` when
    /// the preset is "none" or failed to load.
    #[must_use]
    pub fn new(settings: &Settings, lut: Option<Arc<LutTable>>, params: &EffectParams) -> Self {
        let Some(lut) = lut.filter(|_| settings.is_active()) else {
            return Self::default();
        };
        Self {
            lut: Some(lut),
            grain_intensity: settings
                .grain_enabled
                .then_some(params.grain_intensity)
                .filter(|i| *i > 0.0),
            vignette_amount: settings
                .vignette_enabled
                .then_some(params.vignette_amount)
                .filter(|a| *a > 0.0),
        }
    }

    /// Returns `true` if [`render`] would leave every pixel untouched.
    #[must_use]
    pub const fn is_identity(&self) -> bool {
        self.lut.is_none()
    }

    /// The table this grade maps through, if any.
    #[must_use]
    pub const fn lut(&self) -> Option<&Arc<LutTable>> {
        self.lut.as_ref()
    }
}

/// Apply `grade` to `image` in place.
///
/// `seed` drives the grain generator; callers derive it from the
/// surface's [`Fingerprint`](crate::Fingerprint) so the output is stable.
pub fn render(image: &mut RgbaImage, grade: &Grade, seed: u64) -> RenderStats {
    let mut stats = RenderStats {
        pixel_count: u64::from(image.width()) * u64::from(image.height()),
        ..RenderStats::default()
    };
    let Some(lut) = grade.lut.as_deref() else {
        return stats;
    };

    color::apply_lut(image, lut);
    stats.lut_applied = true;

    if let Some(intensity) = grade.grain_intensity {
        grain::apply_grain(image, intensity, seed);
        stats.grain_applied = true;
    }
    if let Some(amount) = grade.vignette_amount {
        vignette::apply_vignette(image, amount);
        stats.vignette_applied = true;
    }

    trace!(?stats, "rendered");
    stats
}
