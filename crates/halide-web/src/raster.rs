//! Pixel I/O against the browser: decoding surfaces into RGBA buffers
//! through a canvas, and publishing graded buffers as Blob URLs.

use halide_engine::{AssetUrl, EngineError};
use halide_pipeline::RgbaImage;
use image::ImageEncoder;
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::{BlobPropertyBag, CanvasRenderingContext2d, HtmlCanvasElement, HtmlImageElement};

/// Errors from browser raster APIs.
#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    /// PNG encoding failed.
    #[error("PNG encoding failed: {0}")]
    PngEncode(String),

    /// The image did not load or decode.
    #[error("image did not decode: {0}")]
    Decode(String),

    /// The canvas refused to hand out pixels (cross-origin taint).
    #[error("pixel access blocked: {0}")]
    Tainted(String),

    /// A browser API call returned an error.
    #[error("browser API error: {0}")]
    JsError(String),
}

impl From<JsValue> for RasterError {
    fn from(value: JsValue) -> Self {
        Self::JsError(format!("{value:?}"))
    }
}

impl From<image::ImageError> for RasterError {
    fn from(err: image::ImageError) -> Self {
        Self::PngEncode(err.to_string())
    }
}

impl RasterError {
    /// Map into the engine's error space. Decode failures of
    /// cross-origin content count as access failures so the engine tries
    /// the proxy.
    pub fn into_engine(self, locator: &str) -> EngineError {
        match self {
            Self::Tainted(reason) => EngineError::Surface(reason),
            Self::Decode(reason) if is_cross_origin(locator) => EngineError::Surface(reason),
            other => EngineError::load(locator, other),
        }
    }
}

/// Returns `true` if `locator` is an http(s) URL on another origin.
fn is_cross_origin(locator: &str) -> bool {
    let Ok(url) = web_sys::Url::new(locator) else {
        return false;
    };
    let protocol = url.protocol();
    if protocol != "http:" && protocol != "https:" {
        return false;
    }
    web_sys::window()
        .and_then(|w| w.location().origin().ok())
        .is_some_and(|origin| origin != url.origin())
}

/// Decode the image at `locator` and read its pixels back through a
/// canvas.
///
/// # Errors
///
/// Returns [`RasterError::Decode`] if the image does not load and
/// [`RasterError::Tainted`] if the canvas is tainted by cross-origin
/// content.
#[allow(clippy::future_not_send)] // WASM is single-threaded; Send is not needed
pub async fn decode(locator: &str) -> Result<RgbaImage, RasterError> {
    let window = web_sys::window().ok_or_else(|| RasterError::JsError("no global window".into()))?;
    let document = window
        .document()
        .ok_or_else(|| RasterError::JsError("no document".into()))?;

    let img = HtmlImageElement::new()?;
    img.set_cross_origin(Some("anonymous"));
    img.set_src(locator);
    JsFuture::from(img.decode())
        .await
        .map_err(|e| RasterError::Decode(format!("{e:?}")))?;

    let (width, height) = (img.natural_width(), img.natural_height());
    if width == 0 || height == 0 {
        return Err(RasterError::Decode(format!("{locator} has no intrinsic size")));
    }

    let canvas: HtmlCanvasElement = document.create_element("canvas")?.dyn_into().map_err(JsValue::from)?;
    canvas.set_width(width);
    canvas.set_height(height);
    let ctx: CanvasRenderingContext2d = canvas
        .get_context("2d")?
        .ok_or_else(|| RasterError::JsError("no 2d context".into()))?
        .dyn_into().map_err(JsValue::from)?;
    ctx.draw_image_with_html_image_element(&img, 0.0, 0.0)?;

    let data = ctx
        .get_image_data(0.0, 0.0, f64::from(width), f64::from(height))
        .map_err(|e| RasterError::Tainted(format!("{e:?}")))?;
    RgbaImage::from_raw(width, height, data.data().0)
        .ok_or_else(|| RasterError::JsError("pixel buffer size mismatch".into()))
}

/// Encode `image` as a PNG Blob URL.
///
/// The returned URL must be revoked via [`revoke_blob_url`] when no
/// longer needed.
///
/// # Errors
///
/// Returns [`RasterError::PngEncode`] if PNG encoding fails.
/// Returns [`RasterError::JsError`] if Blob or URL creation fails.
pub fn rgba_image_to_blob_url(image: &RgbaImage) -> Result<AssetUrl, RasterError> {
    let mut png_bytes = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut png_bytes);
    encoder.write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgba8,
    )?;

    let uint8_array = js_sys::Uint8Array::from(png_bytes.as_slice());
    let parts = js_sys::Array::new();
    parts.push(&uint8_array);

    let opts = BlobPropertyBag::new();
    opts.set_type("image/png");
    let blob = web_sys::Blob::new_with_u8_array_sequence_and_options(&parts, &opts)?;

    Ok(AssetUrl(web_sys::Url::create_object_url_with_blob(&blob)?))
}

/// Revoke a Blob URL created by [`rgba_image_to_blob_url`].
///
/// Best-effort: the URL may already be revoked.
pub fn revoke_blob_url(url: &AssetUrl) {
    let _ = web_sys::Url::revoke_object_url(url.as_str());
}
