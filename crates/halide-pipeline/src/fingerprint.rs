//! Content + settings fingerprint.
//!
//! A [`Fingerprint`] is the exact identity of one rendered output: the
//! original source locator plus the three settings that change pixels.
//! It is the result-cache key, and its digest seeds the grain generator
//! so a given source under given settings always renders identically.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

use crate::types::Settings;

/// Fixed SipHash key. Digests only need to be stable, not secret.
const DIGEST_KEY: (u64, u64) = (0x6861_6c69_6465_2d66, 0x696e_6765_7270_7269);

/// `(source locator, preset id, grain, vignette)`.
///
/// Equality is exact tuple equality; two fingerprints that differ in any
/// field are different cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    /// Original locator of the surface content (never a produced asset).
    pub source: String,
    /// Preset applied.
    pub preset_id: String,
    /// Whether grain was added.
    pub grain: bool,
    /// Whether a vignette was added.
    pub vignette: bool,
}

impl Fingerprint {
    /// Fingerprint for rendering `source` under `settings`.
    #[must_use]
    pub fn new(source: impl Into<String>, settings: &Settings) -> Self {
        Self {
            source: source.into(),
            preset_id: settings.preset_id.clone(),
            grain: settings.grain_enabled,
            vignette: settings.vignette_enabled,
        }
    }

    /// Stable 64-bit digest (SipHash-1-3 with a fixed key).
    ///
    /// Identical across runs and platforms, unlike `DefaultHasher`.
    #[must_use]
    pub fn digest(&self) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(DIGEST_KEY.0, DIGEST_KEY.1);
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|g{}|v{}",
            self.source,
            self.preset_id,
            u8::from(self.grain),
            u8::from(self.vignette),
        )
    }
}
