//! Engine error taxonomy.
//!
//! Every error is scoped to the single candidate (or preset) that raised
//! it. The scheduler records it on that candidate and keeps going; no
//! variant aborts a run.

use std::time::Duration;

use halide_pipeline::LutError;

/// Errors raised while processing one candidate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The preset's LUT is malformed beyond repair. The preset yields no
    /// transform; candidates stay untouched.
    #[error("preset {preset}: {source}")]
    Parse {
        /// Preset id.
        preset: String,
        /// Underlying parse failure.
        #[source]
        source: LutError,
    },

    /// Image or network failure, including a blocked cross-origin load.
    #[error("failed to load {locator}: {reason}")]
    Load {
        /// What was being loaded.
        locator: String,
        /// Host-reported reason.
        reason: String,
    },

    /// The surface refused pixel access (tainted or untrusted) or
    /// rejected a write.
    #[error("surface unavailable: {0}")]
    Surface(String),

    /// The job exceeded its time bound.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    /// Returns `true` for failures the cross-origin proxy may work around.
    #[must_use]
    pub const fn is_access_failure(&self) -> bool {
        matches!(self, Self::Load { .. } | Self::Surface(_))
    }

    /// Shorthand for a [`Load`](Self::Load) error.
    pub fn load(locator: impl Into<String>, reason: impl ToString) -> Self {
        Self::Load {
            locator: locator.into(),
            reason: reason.to_string(),
        }
    }
}
