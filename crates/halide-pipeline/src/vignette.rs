//! Vignette: radial darkening toward the frame edges.
//!
//! A black radial gradient centered on the image is composited with the
//! "overlay" blend mode. The gradient is fully transparent inside
//! `0.7 × radius` and reaches `amount` opacity at `radius`, holding that
//! opacity beyond it, where `radius = 0.8 × max(width/2, height/2)`.
//!
//! Overlay with a black source reduces to `0` for backdrop values below
//! one half and `2b − 1` above, so shadows deepen faster than highlights
//! and the effect reads like lens falloff rather than a flat dim.

use crate::types::RgbaImage;

/// Fraction of the half-extent used as the outer gradient radius.
pub const RADIUS_FACTOR: f32 = 0.8;

/// Fraction of the outer radius where darkening starts.
pub const INNER_FACTOR: f32 = 0.7;

/// Composite a vignette onto `image` in place. No-op when `amount <= 0`.
#[allow(clippy::cast_precision_loss)]
pub fn apply_vignette(image: &mut RgbaImage, amount: f32) {
    if amount <= 0.0 || !amount.is_finite() {
        return;
    }
    let amount = amount.min(1.0);

    let (width, height) = image.dimensions();
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;
    let outer = RADIUS_FACTOR * cx.max(cy);
    let inner = INNER_FACTOR * outer;

    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let dx = x as f32 + 0.5 - cx;
        let dy = y as f32 + 0.5 - cy;
        let opacity = gradient_opacity(dx.hypot(dy), inner, outer) * amount;
        if opacity <= 0.0 {
            continue;
        }
        for channel in &mut pixel.0[..3] {
            let backdrop = f32::from(*channel) / 255.0;
            let blended = (overlay_black(backdrop) - backdrop).mul_add(opacity, backdrop);
            *channel = crate::color::to_channel(blended);
        }
    }
}

/// Gradient opacity (before scaling by `amount`) at `distance` from center.
#[must_use]
pub fn gradient_opacity(distance: f32, inner: f32, outer: f32) -> f32 {
    if distance <= inner {
        0.0
    } else if distance >= outer {
        1.0
    } else {
        (distance - inner) / (outer - inner)
    }
}

/// Overlay blend of a black source onto `backdrop` (both in `[0, 1]`).
fn overlay_black(backdrop: f32) -> f32 {
    if backdrop <= 0.5 {
        0.0
    } else {
        2.0_f32.mul_add(backdrop, -1.0)
    }
}

#[cfg(test)]
#[allow(clippy::cast_possible_truncation)]
mod tests {
    use image::Rgba;

    use super::*;

    #[test]
    fn zero_amount_is_identity() {
        let mut image = RgbaImage::from_fn(40, 30, |x, y| {
            Rgba([(x * 6) as u8, (y * 8) as u8, 200, 17])
        });
        let original = image.clone();
        apply_vignette(&mut image, 0.0);
        assert_eq!(image, original);
    }

    #[test]
    fn center_is_untouched_and_corners_darken() {
        let mut image = RgbaImage::from_pixel(100, 100, Rgba([200, 200, 200, 255]));
        apply_vignette(&mut image, 0.5);

        assert_eq!(image.get_pixel(50, 50).0, [200, 200, 200, 255]);
        let corner = image.get_pixel(0, 0).0;
        assert!(corner[0] < 200, "corner should darken, got {corner:?}");
        assert_eq!(corner[3], 255);
    }

    #[test]
    fn corner_value_matches_overlay_formula() {
        // Corner is beyond the outer radius: full `amount` opacity.
        let mut image = RgbaImage::from_pixel(100, 100, Rgba([204, 204, 204, 255]));
        apply_vignette(&mut image, 1.0);
        // backdrop 0.8 -> overlay 0.6 -> 153.
        assert_eq!(image.get_pixel(0, 0).0[0], 153);
    }

    #[test]
    fn dark_pixels_go_to_black_at_full_opacity() {
        let mut image = RgbaImage::from_pixel(50, 50, Rgba([100, 60, 20, 90]));
        apply_vignette(&mut image, 1.0);
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 0, 90]);
    }

    #[test]
    fn gradient_opacity_ramps_linearly() {
        assert!((gradient_opacity(0.0, 7.0, 10.0)).abs() < f32::EPSILON);
        assert!((gradient_opacity(7.0, 7.0, 10.0)).abs() < f32::EPSILON);
        assert!((gradient_opacity(8.5, 7.0, 10.0) - 0.5).abs() < 1e-6);
        assert!((gradient_opacity(10.0, 7.0, 10.0) - 1.0).abs() < f32::EPSILON);
        assert!((gradient_opacity(50.0, 7.0, 10.0) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn single_pixel_image_is_safe() {
        let mut image = RgbaImage::from_pixel(1, 1, Rgba([255, 255, 255, 255]));
        apply_vignette(&mut image, 0.4);
        assert_eq!(image.dimensions(), (1, 1));
    }
}
