//! Film grain: per-pixel luminance noise.
//!
//! One uniform sample in `[-0.5, 0.5)` is drawn per pixel, scaled by
//! `intensity · 255`, and added to R, G and B alike (monochrome grain,
//! like silver halide clumps). Results clamp to `[0, 255]`; alpha is
//! untouched.
//!
//! The generator is seeded by the caller. The engine derives the seed
//! from the candidate's fingerprint, so the same source under the same
//! settings always gets the same grain.

use crate::types::RgbaImage;

/// Add grain to `image` in place. No-op when `intensity <= 0`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn apply_grain(image: &mut RgbaImage, intensity: f32, seed: u64) {
    if intensity <= 0.0 || !intensity.is_finite() {
        return;
    }

    let mut rng = fastrand::Rng::with_seed(seed);
    let amplitude = intensity * 255.0;
    for pixel in image.pixels_mut() {
        let noise = (rng.f32() - 0.5) * amplitude;
        for channel in &mut pixel.0[..3] {
            *channel = (f32::from(*channel) + noise).round().clamp(0.0, 255.0) as u8;
        }
    }
}
