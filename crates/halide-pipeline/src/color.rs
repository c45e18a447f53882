//! Color transform: map every pixel through a 3D LUT.
//!
//! Each 8-bit channel is normalized to `[0, 1]`, scaled onto the
//! `N`-point grid, and snapped to the **nearest** grid coordinate
//! (`floor(x·(N−1) + 0.5)`). The three coordinates select one table
//! entry (blue fastest, red slowest; see [`crate::lut`]) which is written
//! back as 8-bit RGB. Alpha passes through unchanged.
//!
//! The transform runs in place: one pass over the buffer, no extra
//! pixel-sized allocation. Grid coordinates for all 256 channel values
//! are computed once per call.

use crate::lut::LutTable;
use crate::types::RgbaImage;

/// Apply `table` to every pixel of `image` in place.
pub fn apply_lut(image: &mut RgbaImage, table: &LutTable) {
    let coords = grid_coords(table.size());
    for pixel in image.pixels_mut() {
        let [r, g, b, _] = pixel.0;
        let [out_r, out_g, out_b] = table.lookup(
            coords[usize::from(r)],
            coords[usize::from(g)],
            coords[usize::from(b)],
        );
        pixel.0[0] = to_channel(out_r);
        pixel.0[1] = to_channel(out_g);
        pixel.0[2] = to_channel(out_b);
    }
}

/// Nearest grid coordinate for every possible 8-bit channel value.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn grid_coords(size: usize) -> [usize; 256] {
    let max = size.saturating_sub(1);
    let scale = max as f32 / 255.0;
    let mut coords = [0_usize; 256];
    for (value, coord) in (0_u8..=255).zip(coords.iter_mut()) {
        let snapped = f32::from(value).mul_add(scale, 0.5).floor();
        *coord = (snapped.max(0.0) as usize).min(max);
    }
    coords
}

/// Convert a `[0, 1]` component to an 8-bit channel value.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn to_channel(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}
