//! [`Host`] implementation over the live DOM.
//!
//! Surfaces are `<img>` elements and any element whose computed
//! `background-image` resolves to a `url(...)`. Computed style is only
//! read for elements with an inline `background` style or a box near the
//! viewport (within the discovery margin). Each surface gets a
//! `data-halide-id` attribute the first time it is seen; the id is the
//! engine's handle for it from then on.
//!
//! Overlays are absolutely positioned `<img>` siblings carrying
//! `data-halide-overlay`, sized from the surface's offset box.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::Duration;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use halide_engine::{
    AssetUrl, DiscoveryLimits, EngineError, Host, ProxyRequest, ProxyResponse, Rect, Runtime, SurfaceContext,
    SurfaceId, SurfaceInfo, SurfaceKind, SurfaceReference,
};
use halide_pipeline::RgbaImage;
use tracing::{debug, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::{Document, Element, HtmlElement, HtmlImageElement, Node, Window};
use web_time::Instant;

use crate::raster;

/// Attribute carrying a surface's engine id.
pub const ID_ATTR: &str = "data-halide-id";

/// Attribute marking our own overlay nodes (value: the covered surface id).
pub const OVERLAY_ATTR: &str = "data-halide-overlay";

/// Elements that can be surfaces, in document order. Our overlays and
/// the insides of vector graphics are excluded up front.
const SURFACE_SELECTOR: &str = "body img:not([data-halide-overlay]), \
     body :not(img):not(script):not(style):not(link):not(meta):not(svg):not(svg *)";

#[wasm_bindgen]
extern "C" {
    /// Privileged cross-origin fetcher provided by the embedding
    /// extension. Takes a JSON `ProxyRequest`, resolves to a JSON
    /// `ProxyResponse`.
    #[wasm_bindgen(catch, js_namespace = globalThis, js_name = halideProxyFetch)]
    fn proxy_fetch_js(request: &str) -> Result<js_sys::Promise, JsValue>;
}

fn window() -> Result<Window, EngineError> {
    web_sys::window().ok_or_else(|| EngineError::Surface("no global window".into()))
}

fn document() -> Result<Document, EngineError> {
    window()?
        .document()
        .ok_or_else(|| EngineError::Surface("no document".into()))
}

fn js_error(value: &JsValue) -> EngineError {
    EngineError::Surface(format!("{value:?}"))
}

/// Extract the first `url(...)` from a CSS `background-image` value.
fn css_url(value: &str) -> Option<String> {
    let start = value.find("url(")? + 4;
    let rest = &value[start..];
    let end = rest.find(')')?;
    let url = rest[..end].trim().trim_matches(|c| c == '"' || c == '\'');
    (!url.is_empty()).then(|| url.to_owned())
}

/// The browser host.
pub struct DomHost {
    origin: Instant,
    lut_base: String,
    next_id: Cell<SurfaceId>,
    elements: RefCell<HashMap<SurfaceId, Element>>,
    overlays: RefCell<HashMap<SurfaceId, HtmlImageElement>>,
    background_margin: f64,
}

impl DomHost {
    /// Default location of the bundled `.cube` presets.
    pub const DEFAULT_LUT_BASE: &str = "assets/luts";

    /// Fallback when the browser has no idle callback.
    const IDLE_FALLBACK: Duration = Duration::from_millis(16);

    /// Create a host fetching presets from `lut_base/<preset>.cube`.
    #[must_use]
    pub fn new(lut_base: impl Into<String>) -> Self {
        Self {
            origin: Instant::now(),
            lut_base: lut_base.into().trim_end_matches('/').to_owned(),
            next_id: Cell::new(1),
            elements: RefCell::new(HashMap::new()),
            overlays: RefCell::new(HashMap::new()),
            background_margin: DiscoveryLimits::DEFAULT_VIEWPORT_MARGIN,
        }
    }

    /// The element registered for `id`.
    #[must_use]
    pub fn element(&self, id: SurfaceId) -> Option<Element> {
        self.elements.borrow().get(&id).cloned()
    }

    /// Stop tracking elements that have left the document and return
    /// their ids.
    pub fn take_detached(&self) -> Vec<SurfaceId> {
        let mut elements = self.elements.borrow_mut();
        let gone: Vec<SurfaceId> = elements
            .iter()
            .filter(|(_, element)| !element.is_connected())
            .map(|(id, _)| *id)
            .collect();
        for id in &gone {
            elements.remove(id);
        }
        gone
    }

    /// The surface `node` covers, if `node` is the overlay currently
    /// installed for it. Overlays we replaced ourselves yield `None`.
    #[must_use]
    pub fn current_overlay_of(&self, node: &Node) -> Option<SurfaceId> {
        let id = node
            .dyn_ref::<Element>()?
            .get_attribute(OVERLAY_ATTR)?
            .parse()
            .ok()?;
        let overlays = self.overlays.borrow();
        let current: &Node = overlays.get(&id)?.as_ref();
        current.is_same_node(Some(node)).then_some(id)
    }

    /// Surface id of `element`, assigning one on first sight.
    fn identify(&self, element: &Element) -> SurfaceId {
        if let Some(id) = element
            .get_attribute(ID_ATTR)
            .and_then(|v| v.parse::<SurfaceId>().ok())
        {
            self.elements
                .borrow_mut()
                .entry(id)
                .or_insert_with(|| element.clone());
            return id;
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        if let Err(e) = element.set_attribute(ID_ATTR, &id.to_string()) {
            debug!(error = ?e, "could not tag surface");
        }
        self.elements.borrow_mut().insert(id, element.clone());
        id
    }

    /// Builder: how far outside the viewport background surfaces are
    /// still inspected.
    #[must_use]
    pub fn with_background_margin(mut self, margin: f64) -> Self {
        self.background_margin = margin;
        self
    }

    fn describe(
        &self,
        element: &Element,
        kind: SurfaceKind,
        locator: String,
        rect: Rect,
        host: &str,
    ) -> SurfaceInfo {
        let in_picture = element
            .parent_element()
            .is_some_and(|p| p.tag_name().eq_ignore_ascii_case("picture"));
        let role = element
            .closest("[role]")
            .ok()
            .flatten()
            .and_then(|e| e.get_attribute("role"));
        let context = SurfaceContext {
            in_picture,
            has_srcset: element.has_attribute("srcset"),
            role,
            host: host.to_owned(),
        };
        SurfaceInfo {
            id: self.identify(element),
            kind,
            rect,
            locator: Some(locator),
            in_vector_subtree: element.closest("svg").ok().flatten().is_some(),
            context,
        }
    }
}

/// Whether an element is worth a computed-style lookup for a background.
/// Inline `background` styles always are; otherwise the element must have
/// area and lie within `window`.
fn may_have_background(inline_style: Option<&str>, rect: &Rect, window: &Rect) -> bool {
    if inline_style.is_some_and(|s| s.contains("background")) {
        return true;
    }
    rect.width > 0.0 && rect.height > 0.0 && rect.intersects(window)
}

fn document_rect(element: &Element, scroll: (f64, f64)) -> Rect {
    let bounds = element.get_bounding_client_rect();
    Rect::new(
        bounds.left() + scroll.0,
        bounds.top() + scroll.1,
        bounds.width(),
        bounds.height(),
    )
}

fn background_url(window: &Window, element: &Element) -> Option<String> {
    let style = window.get_computed_style(element).ok()??;
    css_url(&style.get_property_value("background-image").ok()?)
}

impl Runtime for DomHost {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
        gloo_timers::future::sleep(duration).boxed_local()
    }

    fn idle(&self) -> LocalBoxFuture<'static, ()> {
        let Some(window) = web_sys::window() else {
            return self.sleep(Self::IDLE_FALLBACK);
        };
        let mut requested = false;
        let promise = js_sys::Promise::new(&mut |resolve, _reject| {
            requested = window.request_idle_callback(&resolve).is_ok();
        });
        if !requested {
            return self.sleep(Self::IDLE_FALLBACK);
        }
        async move {
            let _ = JsFuture::from(promise).await;
        }
        .boxed_local()
    }

    fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        wasm_bindgen_futures::spawn_local(task);
    }
}

impl Host for DomHost {
    fn surfaces(&self) -> Vec<SurfaceInfo> {
        let (Ok(window), Ok(document)) = (window(), document()) else {
            return Vec::new();
        };
        let Ok(nodes) = document.query_selector_all(SURFACE_SELECTOR) else {
            return Vec::new();
        };
        let scroll = (
            window.scroll_x().unwrap_or_default(),
            window.scroll_y().unwrap_or_default(),
        );
        let host = window.location().hostname().unwrap_or_default();
        let inspect = self.viewport().expand(self.background_margin);

        self.elements.borrow_mut().retain(|_, e| e.is_connected());
        let mut found = Vec::new();
        for element in (0..nodes.length())
            .filter_map(|i| nodes.item(i))
            .filter_map(|node| node.dyn_into::<Element>().ok())
        {
            let rect = document_rect(&element, scroll);
            let inline_style = element.get_attribute("style");
            let described = if let Some(img) = element.dyn_ref::<HtmlImageElement>() {
                let current = img.current_src();
                let src = if current.is_empty() { img.src() } else { current };
                (!src.is_empty()).then_some((SurfaceKind::Image, src))
            } else if may_have_background(inline_style.as_deref(), &rect, &inspect) {
                background_url(&window, &element).map(|url| (SurfaceKind::Background, url))
            } else {
                None
            };
            if let Some((kind, locator)) = described {
                found.push(self.describe(&element, kind, locator, rect, &host));
            }
        }
        found
    }

    fn viewport(&self) -> Rect {
        let Ok(window) = window() else {
            return Rect::default();
        };
        let size = |v: Result<JsValue, JsValue>| v.ok().and_then(|v| v.as_f64()).unwrap_or_default();
        Rect::new(
            window.scroll_x().unwrap_or_default(),
            window.scroll_y().unwrap_or_default(),
            size(window.inner_width()),
            size(window.inner_height()),
        )
    }

    fn is_attached(&self, id: SurfaceId) -> bool {
        self.elements
            .borrow()
            .get(&id)
            .is_some_and(|e| e.is_connected())
    }

    fn read_reference(&self, id: SurfaceId) -> Option<SurfaceReference> {
        let element = self.element(id)?;
        if element.is_instance_of::<HtmlImageElement>() {
            return Some(SurfaceReference::Image {
                src: element.get_attribute("src").unwrap_or_default(),
                srcset: element.get_attribute("srcset"),
            });
        }
        let style = window().ok()?.get_computed_style(&element).ok()??;
        let value = style.get_property_value("background-image").ok()?;
        Some(SurfaceReference::Background { url: css_url(&value)? })
    }

    fn write_reference(&self, id: SurfaceId, value: &SurfaceReference) -> Result<(), EngineError> {
        let element = self
            .element(id)
            .ok_or_else(|| EngineError::Surface(format!("surface {id} is not tracked")))?;
        match value {
            SurfaceReference::Image { src, srcset } => {
                match srcset {
                    Some(srcset) => element.set_attribute("srcset", srcset),
                    None => element.remove_attribute("srcset"),
                }
                .map_err(|e| js_error(&e))?;
                element.set_attribute("src", src).map_err(|e| js_error(&e))
            }
            SurfaceReference::Background { url } => {
                let html: &HtmlElement = element
                    .dyn_ref()
                    .ok_or_else(|| EngineError::Surface(format!("surface {id} has no style")))?;
                html.style()
                    .set_property("background-image", &format!("url(\"{url}\")"))
                    .map_err(|e| js_error(&e))
            }
        }
    }

    fn insert_overlay(&self, id: SurfaceId, asset: &AssetUrl) -> Result<(), EngineError> {
        let element = self
            .element(id)
            .ok_or_else(|| EngineError::Surface(format!("surface {id} is not tracked")))?;
        let html: &HtmlElement = element
            .dyn_ref()
            .ok_or_else(|| EngineError::Surface(format!("surface {id} is not an HTML element")))?;
        let parent = element
            .parent_node()
            .ok_or_else(|| EngineError::Surface(format!("surface {id} has no parent")))?;

        self.remove_overlay(id);
        let overlay: HtmlImageElement = document()?
            .create_element("img")
            .map_err(|e| js_error(&e))?
            .dyn_into()
            .map_err(|_| EngineError::Surface("created element is not an img".into()))?;
        overlay
            .set_attribute(OVERLAY_ATTR, &id.to_string())
            .map_err(|e| js_error(&e))?;
        overlay.set_alt("");
        overlay.set_src(asset.as_str());
        let style = overlay.style();
        for (property, value) in [
            ("position", "absolute".to_owned()),
            ("left", format!("{}px", html.offset_left())),
            ("top", format!("{}px", html.offset_top())),
            ("width", format!("{}px", html.offset_width())),
            ("height", format!("{}px", html.offset_height())),
            ("pointer-events", "none".to_owned()),
            ("object-fit", "fill".to_owned()),
        ] {
            style
                .set_property(property, &value)
                .map_err(|e| js_error(&e))?;
        }
        parent
            .insert_before(&overlay, element.next_sibling().as_ref())
            .map_err(|e| js_error(&e))?;
        self.overlays.borrow_mut().insert(id, overlay);
        Ok(())
    }

    fn overlay_attached(&self, id: SurfaceId) -> bool {
        self.overlays
            .borrow()
            .get(&id)
            .is_some_and(|o| o.is_connected())
    }

    fn remove_overlay(&self, id: SurfaceId) {
        if let Some(overlay) = self.overlays.borrow_mut().remove(&id) {
            overlay.remove();
        }
    }

    fn set_hidden(&self, id: SurfaceId, hidden: bool) {
        let Some(html) = self
            .element(id)
            .and_then(|e| e.dyn_into::<HtmlElement>().ok())
        else {
            return;
        };
        let style = html.style();
        let result = if hidden {
            style.set_property("visibility", "hidden")
        } else {
            style.remove_property("visibility").map(drop)
        };
        if let Err(e) = result {
            warn!(surface = id, error = ?e, "could not change visibility");
        }
    }

    fn fetch_lut(&self, preset: &str) -> LocalBoxFuture<'static, Result<String, EngineError>> {
        let url = format!("{}/{preset}.cube", self.lut_base);
        async move {
            let fail = |reason: String| EngineError::load(url.clone(), reason);
            let response: web_sys::Response = JsFuture::from(window()?.fetch_with_str(&url))
                .await
                .map_err(|e| fail(format!("{e:?}")))?
                .dyn_into()
                .map_err(|_| fail("not a response".into()))?;
            if !response.ok() {
                return Err(fail(format!("HTTP {}", response.status())));
            }
            let text = JsFuture::from(response.text().map_err(|e| fail(format!("{e:?}")))?)
                .await
                .map_err(|e| fail(format!("{e:?}")))?;
            text.as_string().ok_or_else(|| fail("body is not text".into()))
        }
        .boxed_local()
    }

    fn load_pixels(&self, locator: &str) -> LocalBoxFuture<'static, Result<RgbaImage, EngineError>> {
        let locator = locator.to_owned();
        async move { raster::decode(&locator).await.map_err(|e| e.into_engine(&locator)) }
            .boxed_local()
    }

    fn proxy_fetch(&self, request: ProxyRequest) -> LocalBoxFuture<'static, ProxyResponse> {
        let refused = |error: String| ProxyResponse {
            success: false,
            data_url: None,
            error: Some(error),
        };
        let promise = serde_json::to_string(&request)
            .map_err(|e| e.to_string())
            .and_then(|json| proxy_fetch_js(&json).map_err(|e| format!("{e:?}")));
        async move {
            let promise = match promise {
                Ok(promise) => promise,
                Err(error) => return refused(error),
            };
            match JsFuture::from(promise).await {
                Ok(value) => value
                    .as_string()
                    .and_then(|json| serde_json::from_str(&json).ok())
                    .unwrap_or_else(|| refused("malformed proxy response".into())),
                Err(e) => refused(format!("{e:?}")),
            }
        }
        .boxed_local()
    }

    fn publish(&self, image: &RgbaImage) -> Result<AssetUrl, EngineError> {
        raster::rgba_image_to_blob_url(image).map_err(|e| EngineError::Surface(e.to_string()))
    }

    fn release(&self, asset: &AssetUrl) {
        raster::revoke_blob_url(asset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn css_url_extracts_first_url() {
        assert_eq!(css_url(r#"url("https://a.test/x.jpg")"#).as_deref(), Some("https://a.test/x.jpg"));
        assert_eq!(css_url("url('b.png'), url(c.png)").as_deref(), Some("b.png"));
        assert_eq!(css_url("url(plain.webp)").as_deref(), Some("plain.webp"));
    }

    #[test]
    fn css_url_rejects_gradients_and_none() {
        assert_eq!(css_url("none"), None);
        assert_eq!(css_url("linear-gradient(red, blue)"), None);
        assert_eq!(css_url("url(\"\")"), None);
    }

    #[test]
    fn background_lookup_is_limited_to_hinted_or_nearby_boxes() {
        let window = Rect::new(0.0, 0.0, 1200.0, 800.0).expand(3000.0);
        let near = Rect::new(100.0, 900.0, 300.0, 200.0);
        let far = Rect::new(0.0, 20_000.0, 300.0, 200.0);
        let empty = Rect::new(100.0, 100.0, 0.0, 40.0);

        assert!(may_have_background(None, &near, &window));
        assert!(!may_have_background(None, &far, &window));
        assert!(!may_have_background(Some("color: red"), &empty, &window));
        assert!(may_have_background(
            Some("background-image: url(a.jpg)"),
            &far,
            &window
        ));
    }
}
