//! halide: grade an image file with a CUBE LUT, optional grain, and an
//! optional vignette.
//!
//! Runs the same pixel pipeline the browser host uses, which makes it
//! handy for previewing presets and tuning effect strengths offline.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin halide -- photo.jpg --lut assets/luts/warm-fade.cube --grain -o out.png
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use halide_pipeline::{EffectParams, Fingerprint, Grade, LutTable, RenderStats, Settings};
use image::{DynamicImage, ImageFormat, RgbaImage};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Film-emulation grading for image files.
///
/// Applies a 3D LUT, then optional grain, then an optional vignette,
/// and writes the result.
#[derive(Parser)]
#[command(name = "halide", version)]
struct Cli {
    /// Path to the input image (PNG, JPEG, BMP, WebP).
    input: PathBuf,

    /// CUBE LUT to apply.
    #[arg(long)]
    lut: PathBuf,

    /// Add film grain.
    #[arg(long)]
    grain: bool,

    /// Darken the corners.
    #[arg(long)]
    vignette: bool,

    /// Grain amplitude as a fraction of full range.
    #[arg(long, default_value_t = EffectParams::DEFAULT_GRAIN_INTENSITY)]
    grain_intensity: f32,

    /// Vignette opacity at the corners (0.0-1.0).
    #[arg(long, default_value_t = EffectParams::DEFAULT_VIGNETTE_AMOUNT)]
    vignette_amount: f32,

    /// Grain seed. Defaults to a digest of the input path and settings,
    /// so repeated runs are identical.
    #[arg(long)]
    seed: Option<u64>,

    /// Output path; the format follows the extension.
    #[arg(short, long)]
    output: PathBuf,

    /// Print a JSON render report to stdout.
    #[arg(long)]
    json: bool,
}

/// What one invocation did.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    width: u32,
    height: u32,
    lut_size: usize,
    seed: u64,
    stats: RenderStats,
    #[serde(with = "millis")]
    parse: Duration,
    #[serde(with = "millis")]
    decode: Duration,
    #[serde(with = "millis")]
    render: Duration,
    #[serde(with = "millis")]
    encode: Duration,
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64() * 1000.0)
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Time `f`.
fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let value = f();
    (value, start.elapsed())
}

fn load_lut(path: &Path) -> Result<LutTable, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
    halide_pipeline::lut::parse(&text).map_err(|e| format!("Error parsing {}: {e}", path.display()))
}

/// Write `image`, dropping alpha for formats that cannot carry it.
fn save(image: RgbaImage, path: &Path) -> Result<(), String> {
    let format = ImageFormat::from_path(path)
        .map_err(|e| format!("Unsupported output {}: {e}", path.display()))?;
    let dynamic = DynamicImage::ImageRgba8(image);
    let result = if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(dynamic.to_rgb8()).save_with_format(path, format)
    } else {
        dynamic.save_with_format(path, format)
    };
    result.map_err(|e| format!("Error writing {}: {e}", path.display()))
}

fn run(cli: &Cli) -> Result<Report, String> {
    let (table, parse) = timed(|| load_lut(&cli.lut));
    let table = Arc::new(table?);
    debug!(size = table.size(), lut = %cli.lut.display(), "LUT parsed");

    let (decoded, decode) = timed(|| image::open(&cli.input));
    let mut image = decoded
        .map_err(|e| format!("Error decoding {}: {e}", cli.input.display()))?
        .to_rgba8();

    let preset_id = cli
        .lut
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("custom")
        .to_owned();
    let settings = Settings {
        preset_id,
        grain_enabled: cli.grain,
        vignette_enabled: cli.vignette,
        pipeline_enabled: true,
    };
    let params = EffectParams {
        grain_intensity: cli.grain_intensity,
        vignette_amount: cli.vignette_amount,
    };
    let seed = cli.seed.unwrap_or_else(|| {
        Fingerprint::new(cli.input.display().to_string(), &settings).digest()
    });
    let grade = Grade::new(&settings, Some(Arc::clone(&table)), &params);

    let (stats, render) = timed(|| halide_pipeline::render(&mut image, &grade, seed));
    let (width, height) = image.dimensions();
    let (saved, encode) = timed(|| save(image, &cli.output));
    saved?;

    info!(output = %cli.output.display(), width, height, "graded");
    Ok(Report {
        width,
        height,
        lut_size: table.size(),
        seed,
        stats,
        parse,
        decode,
        render,
        encode,
    })
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let report = match run(&cli) {
        Ok(report) => report,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing report: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        eprintln!(
            "{}x{} graded with a {}-point LUT in {:.3}ms -> {}",
            report.width,
            report.height,
            report.lut_size,
            report.render.as_secs_f64() * 1000.0,
            cli.output.display(),
        );
    }
    ExitCode::SUCCESS
}
