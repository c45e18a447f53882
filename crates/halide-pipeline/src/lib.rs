//! halide-pipeline: Pure film-emulation pixel pipeline (sans-IO).
//!
//! Turns an RGBA buffer into a graded one through:
//! 3D LUT color transform -> optional grain -> optional vignette.
//!
//! This crate has **no I/O dependencies** -- it parses LUT text handed to
//! it and mutates in-memory pixel buffers. Fetching presets, reading
//! pixels from surfaces, and publishing results all live in
//! `halide-engine` (coordination) and `halide-web` (browser host).
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use halide_pipeline::{EffectParams, Fingerprint, Grade, RgbaImage, Settings};
//!
//! let table = halide_pipeline::lut::parse(
//!     "LUT_3D_SIZE 2\n\
//!      1 0 0\n1 0 0\n1 0 0\n1 0 0\n1 0 0\n1 0 0\n1 0 0\n1 0 0\n",
//! )
//! .unwrap();
//! let settings = Settings {
//!     preset_id: "red".into(),
//!     ..Settings::default()
//! };
//! let grade = Grade::new(&settings, Some(Arc::new(table)), &EffectParams::default());
//!
//! let mut image = RgbaImage::from_pixel(2, 2, image::Rgba([10, 200, 30, 128]));
//! let seed = Fingerprint::new("demo.png", &settings).digest();
//! let stats = halide_pipeline::render(&mut image, &grade, seed);
//!
//! assert!(stats.lut_applied);
//! assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0, 128]);
//! ```

pub mod color;
pub mod fingerprint;
pub mod grain;
pub mod library;
pub mod lut;
pub mod render;
pub mod types;
pub mod vignette;

pub use fingerprint::Fingerprint;
pub use library::{LutLibrary, LutOutcome};
pub use lut::LutTable;
pub use render::{Grade, render};
pub use types::{EffectParams, LutError, PRESET_NONE, RenderStats, RgbaImage, Settings};
