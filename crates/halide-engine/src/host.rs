//! The seam between the engine and its environment.
//!
//! The engine never touches a document, a timer, or the network
//! directly. Everything it needs from the outside world goes through
//! [`Runtime`] (time and task spawning) and [`Host`] (surfaces, pixels,
//! presets, published assets). The browser crate implements both over
//! `web-sys`; tests implement them over in-memory state and virtual time.
//!
//! All futures are `'static` and `!Send`: the engine runs on a single
//! cooperative loop, so implementations clone whatever handles they need
//! into the returned future instead of borrowing `self`.

use std::fmt;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use halide_pipeline::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::message::{ProxyRequest, ProxyResponse};

/// Stable identity of one surface, assigned by the host.
pub type SurfaceId = u64;

/// Axis-aligned rectangle in document CSS pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge.
    pub x: f64,
    /// Top edge.
    pub y: f64,
    /// Width (non-negative).
    pub width: f64,
    /// Height (non-negative).
    pub height: f64,
}

impl Rect {
    /// Construct a rectangle.
    #[must_use]
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Right edge.
    #[must_use]
    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    /// Bottom edge.
    #[must_use]
    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Grow by `margin` on every side.
    #[must_use]
    pub fn expand(&self, margin: f64) -> Self {
        Self::new(
            self.x - margin,
            self.y - margin,
            2.0f64.mul_add(margin, self.width),
            2.0f64.mul_add(margin, self.height),
        )
    }

    /// Returns `true` if the two rectangles overlap (touching edges do not
    /// count).
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// Euclidean gap between the two rectangles; `0.0` when they overlap.
    #[must_use]
    pub fn distance_to(&self, other: &Self) -> f64 {
        let dx = (other.x - self.right()).max(self.x - other.right()).max(0.0);
        let dy = (other.y - self.bottom()).max(self.y - other.bottom()).max(0.0);
        dx.hypot(dy)
    }

    /// Estimated decoded RGBA size in bytes, saturating at `u64::MAX`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn rgba_bytes(&self) -> u64 {
        (self.width.max(0.0).ceil() as u64)
            .saturating_mul(self.height.max(0.0).ceil() as u64)
            .saturating_mul(4)
    }
}

/// How a surface displays its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SurfaceKind {
    /// An image node (`src`/`srcset`).
    Image,
    /// Any node with a resolved background-image reference.
    Background,
}

/// Structural context used to pick a resilience strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SurfaceContext {
    /// The surface is inside a responsive `<picture>` wrapper.
    pub in_picture: bool,
    /// The surface carries a `srcset`.
    pub has_srcset: bool,
    /// ARIA role of the surface or its nearest wrapper.
    pub role: Option<String>,
    /// Host name of the document.
    pub host: String,
}

/// One surface as reported by the host at scan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceInfo {
    /// Host-assigned identity.
    pub id: SurfaceId,
    /// Image node or background.
    pub kind: SurfaceKind,
    /// Layout box in document coordinates.
    pub rect: Rect,
    /// Resolved content locator. `None` (or `"none"`) when the surface
    /// has no content to transform.
    pub locator: Option<String>,
    /// The surface sits inside a vector/icon subtree.
    #[serde(default)]
    pub in_vector_subtree: bool,
    /// Wrapper/role/host information.
    #[serde(default)]
    pub context: SurfaceContext,
}

/// The visible reference of a surface, captured so it can be restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SurfaceReference {
    /// Image node attributes.
    Image {
        /// `src` attribute.
        src: String,
        /// `srcset` attribute, if present.
        srcset: Option<String>,
    },
    /// Background-image locator.
    Background {
        /// The url inside `background-image`.
        url: String,
    },
}

impl SurfaceReference {
    /// Reference that points a surface of `kind` at `locator`.
    ///
    /// Image references drop `srcset` so the browser cannot pick a
    /// different candidate over the committed asset.
    #[must_use]
    pub fn pointing_at(kind: SurfaceKind, locator: &str) -> Self {
        match kind {
            SurfaceKind::Image => Self::Image {
                src: locator.to_owned(),
                srcset: None,
            },
            SurfaceKind::Background => Self::Background {
                url: locator.to_owned(),
            },
        }
    }

    /// The locator this reference displays.
    #[must_use]
    pub fn locator(&self) -> &str {
        match self {
            Self::Image { src, .. } => src,
            Self::Background { url } => url,
        }
    }
}

/// A produced asset the host can display (a blob URL in the browser).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetUrl(pub String);

impl AssetUrl {
    /// The URL string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Change notifications delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Surfaces were added or changed; coalesced before rescanning.
    SurfacesChanged,
    /// A surface left the document.
    SurfaceDetached(SurfaceId),
    /// Something wrote a surface's visible reference.
    ReferenceChanged {
        /// Surface written.
        id: SurfaceId,
        /// Value that was written.
        value: SurfaceReference,
    },
    /// The presentation node covering a surface was removed.
    OverlayRemoved(SurfaceId),
}

/// Time, timers, and task spawning for a single-threaded executor.
pub trait Runtime: 'static {
    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;

    /// Resolve after `duration`.
    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()>;

    /// Resolve at the next idle period (or a short timeout when the host
    /// has no idle notion).
    fn idle(&self) -> LocalBoxFuture<'static, ()>;

    /// Run `task` to completion in the background.
    fn spawn(&self, task: LocalBoxFuture<'static, ()>);
}

/// Surface access, pixel I/O, and asset publishing.
pub trait Host: Runtime {
    /// Every surface currently in the document, in document order.
    fn surfaces(&self) -> Vec<SurfaceInfo>;

    /// The visible window in document coordinates.
    fn viewport(&self) -> Rect;

    /// Returns `true` while the surface is part of the document.
    fn is_attached(&self, id: SurfaceId) -> bool;

    /// Current visible reference of a surface.
    fn read_reference(&self, id: SurfaceId) -> Option<SurfaceReference>;

    /// Overwrite a surface's visible reference.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Surface`] if the surface is gone or
    /// refuses the write.
    fn write_reference(&self, id: SurfaceId, value: &SurfaceReference) -> Result<(), EngineError>;

    /// Insert (or replace) a presentation node showing `asset` exactly
    /// over the surface.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Surface`] if the surface has no parent to
    /// attach the overlay to.
    fn insert_overlay(&self, id: SurfaceId, asset: &AssetUrl) -> Result<(), EngineError>;

    /// Returns `true` while the overlay for `id` is in the document.
    fn overlay_attached(&self, id: SurfaceId) -> bool;

    /// Remove the overlay for `id`, if any.
    fn remove_overlay(&self, id: SurfaceId);

    /// Hide or show a surface without detaching it.
    fn set_hidden(&self, id: SurfaceId, hidden: bool);

    /// Fetch the CUBE text for `preset`.
    fn fetch_lut(&self, preset: &str) -> LocalBoxFuture<'static, Result<String, EngineError>>;

    /// Decode the content at `locator` into pixels.
    ///
    /// Fails with [`EngineError::Load`] on network/decode failure and
    /// [`EngineError::Surface`] when pixel access is blocked.
    fn load_pixels(&self, locator: &str) -> LocalBoxFuture<'static, Result<RgbaImage, EngineError>>;

    /// Ask the privileged proxy to fetch a cross-origin image.
    fn proxy_fetch(&self, request: ProxyRequest) -> LocalBoxFuture<'static, ProxyResponse>;

    /// Make `image` displayable and return its locator.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Surface`] if the host cannot encode or
    /// register the asset.
    fn publish(&self, image: &RgbaImage) -> Result<AssetUrl, EngineError>;

    /// Release a previously published asset.
    fn release(&self, asset: &AssetUrl);
}
